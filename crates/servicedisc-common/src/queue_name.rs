//! Queue name derivation.
//!
//! Names are restricted to `[a-z0-9-]`, 3 to 63 characters, without a
//! leading or trailing `-` after truncation.

pub const MIN_QUEUE_NAME_LEN: usize = 3;
pub const MAX_QUEUE_NAME_LEN: usize = 63;

/// Suffix appended to the inbound queue of a queue host.
pub const HOST_QUEUE_SUFFIX: &str = "-qsh";

/// Derives a queue name from a fully-qualified type name.
pub fn queue_name(type_name: &str) -> String {
    let mut name = String::with_capacity(type_name.len());
    let mut in_run = false;
    for c in type_name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            name.push(c);
            in_run = false;
        } else if !in_run {
            name.push('-');
            in_run = true;
        }
    }

    if name.len() < MIN_QUEUE_NAME_LEN {
        name.push_str("-q");
        name
    } else {
        truncate(name)
    }
}

/// Inbound queue name of a queue host serving `interface_type`.
pub fn host_queue_name(interface_type: &str) -> String {
    let mut name = queue_name(interface_type);
    name.push_str(HOST_QUEUE_SUFFIX);
    truncate(name)
}

// Keeps the trailing characters; name is ASCII at this point.
fn truncate(name: String) -> String {
    if name.len() <= MAX_QUEUE_NAME_LEN {
        return name;
    }
    name[name.len() - MAX_QUEUE_NAME_LEN..]
        .trim_matches('-')
        .to_string()
}
