//! Self-describing shard object names.
//!
//! A shard object is named `<prefix>-s<index:03>-b<offset:010>.<ext>`, so the
//! index and starting byte offset of every stored shard can be recovered from
//! a listing alone. Widths are minimums: index 1000 is written `s1000` and
//! parsed numerically, so nothing truncates past 999.
//!
//! The plaintext metadata for a shard lives next to it under the shard's
//! object name plus [`SIDECAR_SUFFIX`].

/// Suffix appended to a shard object name to form its metadata sidecar name.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

const INDEX_WIDTH: usize = 3;
const OFFSET_WIDTH: usize = 10;

/// The parsed components of a shard object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardName {
    pub prefix: String,
    pub index: u64,
    pub byte_offset: u64,
    /// Informational pipeline suffix, e.g. `zst.age`. Never used for control decisions.
    pub ext: String,
}

/// How an object name relates to a backup prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    /// A shard object of this backup.
    Shard(ShardName),
    /// The metadata sidecar of the named shard.
    Sidecar(ShardName),
    /// Not part of this backup.
    Unrelated,
    /// Claims to be a shard of this backup but does not parse.
    Malformed(String),
}

impl ShardName {
    pub fn new(prefix: &str, index: u64, byte_offset: u64, ext: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            index,
            byte_offset,
            ext: ext.to_string(),
        }
    }

    /// The object name, e.g. `full-20240101T000000Z-s002-b0010485760.zst.age`.
    pub fn object_name(&self) -> String {
        format!(
            "{}-s{:0iw$}-b{:0ow$}.{}",
            self.prefix,
            self.index,
            self.byte_offset,
            self.ext,
            iw = INDEX_WIDTH,
            ow = OFFSET_WIDTH,
        )
    }

    pub fn sidecar_name(&self) -> String {
        format!("{}{}", self.object_name(), SIDECAR_SUFFIX)
    }
}

/// Classify `name` against a known backup prefix.
///
/// Names that do not begin with `<prefix>-s<digits>-b` belong to something
/// else and are `Unrelated`. Anything that does begin that way must parse
/// completely, in canonical zero-padded form, or it is `Malformed`.
pub fn classify(prefix: &str, name: &str) -> NameMatch {
    let Some(rest) = name.strip_prefix(prefix).and_then(|r| r.strip_prefix("-s")) else {
        return NameMatch::Unrelated;
    };

    let index_digits = leading_digits(rest);
    if index_digits.is_empty() {
        return NameMatch::Unrelated;
    }
    let Some(rest) = rest[index_digits.len()..].strip_prefix("-b") else {
        return NameMatch::Unrelated;
    };

    let malformed = |why: &str| NameMatch::Malformed(format!("{}: {}", name, why));

    let offset_digits = leading_digits(rest);
    if offset_digits.is_empty() {
        return malformed("missing byte offset");
    }
    let Some(ext) = rest[offset_digits.len()..].strip_prefix('.') else {
        return malformed("missing extension");
    };

    let Ok(index) = index_digits.parse::<u64>() else {
        return malformed("index out of range");
    };
    let Ok(byte_offset) = offset_digits.parse::<u64>() else {
        return malformed("byte offset out of range");
    };
    if index == 0 {
        return malformed("shard indices start at 1");
    }
    if format!("{:0w$}", index, w = INDEX_WIDTH) != index_digits
        || format!("{:0w$}", byte_offset, w = OFFSET_WIDTH) != offset_digits
    {
        return malformed("non-canonical zero padding");
    }

    match ext.strip_suffix(SIDECAR_SUFFIX) {
        Some(shard_ext) if !shard_ext.is_empty() => {
            NameMatch::Sidecar(ShardName::new(prefix, index, byte_offset, shard_ext))
        }
        Some(_) => malformed("sidecar without shard extension"),
        None if ext.is_empty() || ext == &SIDECAR_SUFFIX[1..] => malformed("missing extension"),
        None => NameMatch::Shard(ShardName::new(prefix, index, byte_offset, ext)),
    }
}

/// Parse a shard or sidecar name without knowing its prefix.
///
/// The rightmost `-s` split that yields a well-formed shard name wins, so
/// prefixes that themselves contain `-s` are handled.
pub fn parse_any(name: &str) -> Option<NameMatch> {
    for (pos, _) in name.rmatch_indices("-s") {
        if pos == 0 {
            continue;
        }
        match classify(&name[..pos], name) {
            m @ (NameMatch::Shard(_) | NameMatch::Sidecar(_)) => return Some(m),
            _ => continue,
        }
    }
    None
}

fn leading_digits(s: &str) -> &str {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_format() {
        let name = ShardName::new("full-20240101T000000Z", 2, 10_485_760, "zst.age");
        assert_eq!(
            name.object_name(),
            "full-20240101T000000Z-s002-b0010485760.zst.age"
        );
        assert_eq!(
            name.sidecar_name(),
            "full-20240101T000000Z-s002-b0010485760.zst.age.meta.json"
        );
    }

    #[test]
    fn test_index_widens_past_999() {
        let name = ShardName::new("p", 1000, 0, "zst.age");
        assert_eq!(name.object_name(), "p-s1000-b0000000000.zst.age");
        assert_eq!(classify("p", &name.object_name()), NameMatch::Shard(name));
    }

    #[test]
    fn test_offset_widens_past_ten_digits() {
        let name = ShardName::new("p", 7, 123_456_789_012, "age");
        assert_eq!(name.object_name(), "p-s007-b123456789012.age");
        assert_eq!(classify("p", &name.object_name()), NameMatch::Shard(name));
    }

    #[test]
    fn test_classify_parses_shard_and_sidecar() {
        let shard = ShardName::new("full-x", 3, 42, "zst.age");
        assert_eq!(
            classify("full-x", &shard.object_name()),
            NameMatch::Shard(shard.clone())
        );
        assert_eq!(
            classify("full-x", &shard.sidecar_name()),
            NameMatch::Sidecar(shard)
        );
    }

    #[test]
    fn test_classify_ignores_unrelated_names() {
        assert_eq!(classify("full-x", "README"), NameMatch::Unrelated);
        assert_eq!(classify("full-x", "full-y-s001-b0000000000.age"), NameMatch::Unrelated);
        assert_eq!(classify("full-x", "full-x.lock"), NameMatch::Unrelated);
        // Another backup whose prefix extends ours.
        assert_eq!(classify("full-x", "full-x-s5-s001-b0000000000.age"), NameMatch::Unrelated);
    }

    #[test]
    fn test_classify_reports_malformed_names() {
        let cases = [
            "full-x-s001-b.age",
            "full-x-s001-b0000000000",
            "full-x-s001-b0000000000.",
            "full-x-s0001-b0000000000.age",
            "full-x-s001-b000000000.age",
            "full-x-s000-b0000000000.age",
            "full-x-s001-b0000000000.meta.json",
        ];
        for case in cases {
            assert!(
                matches!(classify("full-x", case), NameMatch::Malformed(_)),
                "expected {} to be malformed",
                case
            );
        }
    }

    #[test]
    fn test_parse_any_recovers_prefix() {
        let shard = ShardName::new("incr-2024-s1", 12, 99, "zst.age");
        match parse_any(&shard.object_name()) {
            Some(NameMatch::Shard(parsed)) => assert_eq!(parsed, shard),
            other => panic!("unexpected parse: {:?}", other),
        }
        match parse_any(&shard.sidecar_name()) {
            Some(NameMatch::Sidecar(parsed)) => assert_eq!(parsed, shard),
            other => panic!("unexpected parse: {:?}", other),
        }
        assert_eq!(parse_any("notes.txt"), None);
        assert_eq!(parse_any("-s001-b0000000000.age"), None);
    }
}
