//! `lockspace_name[:host_id]` token parsing for the `reset` subcommand's
//! positional arguments (§6.4).

/// One positional token passed to `clusterfence-reset reset`: a
/// lockspace name, optionally pinned to a specific host id within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockspaceTarget {
    pub name: String,
    pub host_id: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TargetParseError {
    #[error("target string ends in a dangling escape character")]
    TrailingEscape,

    #[error("target string has an empty lockspace name")]
    EmptyName,

    #[error("invalid host id {0:?}")]
    InvalidHostId(String),
}

fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '\\' || c == ':' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render a target back to its CLI string form, escaping any literal
/// `:` or `\` in the lockspace name.
#[must_use]
pub fn res_to_str(target: &LockspaceTarget) -> String {
    let mut s = escape(&target.name);
    if let Some(host_id) = target.host_id {
        s.push(':');
        s.push_str(&host_id.to_string());
    }
    s
}

/// Parse a `lockspace_name[:host_id]` token, honoring `\:` and `\\`
/// escapes in the name.
pub fn str_to_res(s: &str) -> Result<LockspaceTarget, TargetParseError> {
    let mut name = String::new();
    let mut chars = s.chars();
    let mut escaped = false;
    let mut host_part: Option<String> = None;

    while let Some(c) = chars.next() {
        if escaped {
            name.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ':' {
            host_part = Some(chars.by_ref().collect());
            break;
        } else {
            name.push(c);
        }
    }
    if escaped {
        return Err(TargetParseError::TrailingEscape);
    }
    if name.is_empty() {
        return Err(TargetParseError::EmptyName);
    }

    let host_id = match host_part {
        None => None,
        Some(digits) => Some(
            digits
                .parse::<u64>()
                .map_err(|_| TargetParseError::InvalidHostId(digits))?,
        ),
    };

    Ok(LockspaceTarget { name, host_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_plain_name() {
        let target = LockspaceTarget {
            name: "cluster-a".to_string(),
            host_id: Some(2),
        };
        let s = res_to_str(&target);
        assert_eq!(str_to_res(&s).unwrap(), target);
    }

    #[test]
    fn roundtrips_name_with_no_host_id() {
        let target = LockspaceTarget {
            name: "cluster-a".to_string(),
            host_id: None,
        };
        assert_eq!(str_to_res(&res_to_str(&target)).unwrap(), target);
    }

    #[test]
    fn roundtrips_name_containing_colon() {
        let target = LockspaceTarget {
            name: "weird:name".to_string(),
            host_id: Some(9),
        };
        let encoded = res_to_str(&target);
        assert_eq!(encoded, "weird\\:name:9");
        assert_eq!(str_to_res(&encoded).unwrap(), target);
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(str_to_res(":5"), Err(TargetParseError::EmptyName)));
    }

    #[test]
    fn rejects_non_numeric_host_id() {
        assert!(matches!(
            str_to_res("ls:abc"),
            Err(TargetParseError::InvalidHostId(_))
        ));
    }

    #[test]
    fn rejects_trailing_escape() {
        assert!(matches!(
            str_to_res("ls\\"),
            Err(TargetParseError::TrailingEscape)
        ));
    }
}
