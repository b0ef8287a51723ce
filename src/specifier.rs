//! Percent-specifier expansion in declared names.

use std::fs;

use crate::error::ProvisionError;

/// Expand `%m`, `%b`, `%H` and `%v` from the running host, plus `%%` for a
/// literal percent sign. Unknown or unavailable specifiers fail the line.
pub fn expand(input: &str) -> Result<String, ProvisionError> {
    expand_with(input, host_value)
}

fn expand_with(
    input: &str,
    lookup: impl Fn(char) -> Option<String>,
) -> Result<String, ProvisionError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // a trailing lone '%' stays literal
            None => out.push('%'),
            Some('%') => out.push('%'),
            Some(spec) => match lookup(spec) {
                Some(value) => out.push_str(&value),
                None => return Err(ProvisionError::BadSpecifier(spec)),
            },
        }
    }
    Ok(out)
}

fn host_value(spec: char) -> Option<String> {
    match spec {
        'm' => read_trimmed("/etc/machine-id"),
        // the kernel formats the boot id with dashes, ids are used bare
        'b' => read_trimmed("/proc/sys/kernel/random/boot_id").map(|s| s.replace('-', "")),
        'H' => read_trimmed("/proc/sys/kernel/hostname"),
        'v' => read_trimmed("/proc/sys/kernel/osrelease"),
        _ => None,
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
