//! Name validation shared by services, volumes, networks, and TLS
//! certificates. Length limits follow the same precedent the teacher applies
//! to job names (`manager::manager::JOB_NAME_MAX_SIZE` /
//! `JOB_NAME_MAX_LABEL_LENGTH`): long enough for DNS-safe labels, short
//! enough to leave room for suffixes appended downstream (`<service>-<n>`
//! for DNS, a Raft-log JSON envelope, and so on).

const NAME_MAX_SIZE: usize = 180;
const NAME_MAX_LABEL_LENGTH: usize = 63;

/// A valid name is one or more dot-separated DNS labels: lowercase
/// alphanumeric, optionally hyphenated, never starting or ending with a
/// hyphen.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX_SIZE || name.ends_with('.') {
        return false;
    }

    name.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > NAME_MAX_LABEL_LENGTH {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name("web-frontend"));
        assert!(is_valid_name("web.frontend"));
    }

    #[test]
    fn rejects_uppercase_and_leading_hyphen() {
        assert!(!is_valid_name("Web"));
        assert!(!is_valid_name("-web"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn rejects_oversized_names_and_labels() {
        assert!(!is_valid_name(&"a".repeat(NAME_MAX_SIZE + 1)));
        assert!(!is_valid_name(&format!("{}.b", "a".repeat(NAME_MAX_LABEL_LENGTH + 1))));
    }
}
