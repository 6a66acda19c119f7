// Externally visible tool/resource/prompt identifiers are suffixed with the
// owning server instance: "{original}_-_{instance}". Parsing splits on the
// LAST separator so originals containing the separator still round-trip.

pub const SEPARATOR: &str = "_-_";

pub fn prefixed(original: &str, instance_id: &str) -> String {
    format!("{original}{SEPARATOR}{instance_id}")
}

/// Returns `(original, instance_id)`, or `None` when no separator is present.
pub fn split(name: &str) -> Option<(&str, &str)> {
    let idx = name.rfind(SEPARATOR)?;
    let original = &name[..idx];
    let instance = &name[idx + SEPARATOR.len()..];
    if original.is_empty() || instance.is_empty() {
        return None;
    }
    Some((original, instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_then_split_is_identity() {
        for (name, inst) in [("search", "1"), ("a_-_b", "42"), ("x", "srv-9")] {
            let full = prefixed(name, inst);
            let (back_name, back_inst) = split(&full).unwrap();
            assert_eq!(back_name, name);
            assert_eq!(back_inst, inst);
            assert_eq!(prefixed(back_name, back_inst), full);
        }
    }

    #[test]
    fn split_uses_last_separator() {
        let (name, inst) = split("weird_-_tool_-_7").unwrap();
        assert_eq!(name, "weird_-_tool");
        assert_eq!(inst, "7");
    }

    #[test]
    fn missing_or_empty_parts_fail() {
        assert!(split("plain").is_none());
        assert!(split("_-_1").is_none());
        assert!(split("tool_-_").is_none());
    }
}
