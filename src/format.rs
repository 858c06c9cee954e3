//! Parser for tracepoint `format` files under
//! `/sys/kernel/tracing/events/<system>/<event>/format`.
//!
//! The collector needs two things from a format file: the kernel-assigned
//! event id (`common_type` value used in ring-buffer records) and the field
//! layout, split into the leading `common_*` header fields and the
//! event-specific payload fields.

use compact_str::CompactString;
use smallvec::SmallVec;
use std::borrow::Cow;

/// Error type for format-file parsing.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// A line or clause did not match the expected `key: value` shape.
    #[error("malformed format file: {0}")]
    Malformed(String),
    /// A numeric clause (`ID`, `offset`, `size`, `signed`) failed to parse.
    #[error("invalid value for {0:?}: {1:?}")]
    InvalidValue(&'static str, String),
    /// The file had no `ID:` line.
    #[error("format file is missing the event ID")]
    MissingId,
    /// IO error when reading the format file.
    #[error("failed to read format file: {0}")]
    Io(#[from] std::io::Error),
}

/// How a field's bytes are laid out in the record payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// Scalar. Example: `char val; size:1;`
    None,
    /// Fixed-length array (length folded into `size`). Example: `char val[16];`
    Fixed,
    /// Array occupying the rest of the record. Example: `char val[]; size:0;`
    Trailing,
    /// `__data_loc`/`__rel_loc` 4-byte descriptor: upper half length,
    /// lower half offset. Example: `__data_loc char[] val; size:4;`
    Loc4,
}

/// One field declaration from a format file.
#[derive(Debug, Clone)]
pub struct FormatField {
    /// C type text, e.g. `int`, `char[16]`, `__data_loc char[]`.
    pub c_type: CompactString,
    /// Field name, e.g. `prev_comm`.
    pub name: CompactString,
    /// Byte offset from the start of the record.
    pub offset: u32,
    /// Size in bytes (0 for trailing arrays).
    pub size: u32,
    /// Signedness as declared by the kernel.
    pub signed: bool,
    /// Array classification.
    pub array: ArrayKind,
}

/// Parsed contents of one tracepoint format file.
#[derive(Debug, Clone)]
pub struct EventFormat {
    /// Event name as declared in the file (no system prefix).
    pub name: CompactString,
    /// Kernel-assigned event id (`common_type` in ring-buffer records).
    pub id: u32,
    /// Number of leading `common_*` fields in [`Self::fields`].
    pub common_field_count: usize,
    /// All fields, common header first.
    pub fields: Vec<FormatField>,
}

static FIXED_REGEX: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"\[[0-9]+\]$").expect("Failed to compile regex")
});

impl EventFormat {
    /// Parse the text of one format file.
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        let mut name = CompactString::default();
        let mut id = None;
        let mut fields = Vec::new();
        let mut in_format = false;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if in_format {
                if line.starts_with('\t') {
                    if let Some(field) = FormatField::parse(line)? {
                        fields.push(field);
                    }
                    continue;
                }
                in_format = false;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| {
                FormatError::Malformed(format!("line without a colon: {line:?}"))
            })?;
            let value = value.strip_prefix(' ').unwrap_or(value);
            match key {
                "name" => name = value.into(),
                "ID" => {
                    id = Some(value.parse::<u32>().map_err(|_| {
                        FormatError::InvalidValue("ID", value.to_string())
                    })?);
                }
                "format" => in_format = true,
                "print fmt" => {}
                // Newer kernels add keys; a collector must tolerate them.
                other => log::debug!("ignoring unknown format file key: {other:?}"),
            }
        }

        let common_field_count = fields
            .iter()
            .take_while(|f| f.name.starts_with("common_"))
            .count();

        Ok(Self {
            name,
            id: id.ok_or(FormatError::MissingId)?,
            common_field_count,
            fields,
        })
    }

    /// The event-specific fields (everything after the common header).
    pub fn payload_fields(&self) -> &[FormatField] {
        &self.fields[self.common_field_count..]
    }
}

impl FormatField {
    /// Parse one tab-indented field line. Returns `Ok(None)` for blank lines.
    fn parse(line: &str) -> Result<Option<Self>, FormatError> {
        if line.is_empty() {
            return Ok(None);
        }
        let clauses: SmallVec<[&str; 4]> = line[1..].split('\t').collect();
        if clauses.len() != 4 {
            return Err(FormatError::Malformed(format!(
                "expected 4 field clauses, got {}",
                clauses.len()
            )));
        }

        let mut c_type: Option<Cow<'_, str>> = None;
        let mut name = None;
        let mut offset = 0;
        let mut size = 0;
        let mut signed = false;
        for clause in clauses {
            let clause = clause.strip_suffix(';').unwrap_or(clause);
            let (key, value) = clause.split_once(':').ok_or_else(|| {
                FormatError::Malformed(format!("field clause without a colon: {clause:?}"))
            })?;
            match key {
                "field" => {
                    let last_space = value.rfind(' ').ok_or_else(|| {
                        FormatError::Malformed(format!(
                            "field declaration without a space: {value:?}"
                        ))
                    })?;
                    let decl_type = &value[..last_space];
                    let decl_name = &value[last_space + 1..];
                    // `char comm[16]` declares the array on the name; move
                    // the suffix to the type.
                    if let Some(idx) = decl_name.rfind('[') {
                        c_type = Some(Cow::Owned(format!("{decl_type}{}", &decl_name[idx..])));
                        name = Some(&decl_name[..idx]);
                    } else {
                        c_type = Some(Cow::Borrowed(decl_type));
                        name = Some(decl_name);
                    }
                }
                "offset" => {
                    offset = value.parse::<u32>().map_err(|_| {
                        FormatError::InvalidValue("offset", value.to_string())
                    })?;
                }
                "size" => {
                    size = value.parse::<u32>().map_err(|_| {
                        FormatError::InvalidValue("size", value.to_string())
                    })?;
                }
                "signed" => {
                    signed = match value {
                        "1" => true,
                        "0" => false,
                        _ => {
                            return Err(FormatError::InvalidValue("signed", value.to_string()));
                        }
                    };
                }
                other => {
                    return Err(FormatError::Malformed(format!(
                        "unknown field clause: {other:?}"
                    )));
                }
            }
        }

        let c_type: CompactString = c_type
            .ok_or_else(|| FormatError::Malformed("missing field type".to_string()))?
            .into();
        let name: CompactString = name
            .ok_or_else(|| FormatError::Malformed("missing field name".to_string()))?
            .into();

        let array = if (c_type.starts_with("__data_loc") || c_type.starts_with("__rel_loc"))
            && size == 4
        {
            ArrayKind::Loc4
        } else if c_type.ends_with("[]") && size == 0 {
            ArrayKind::Trailing
        } else if FIXED_REGEX.is_match(&c_type) {
            ArrayKind::Fixed
        } else {
            ArrayKind::None
        };

        Ok(Some(Self {
            c_type,
            name,
            offset,
            size,
            signed,
            array,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_format_file() {
        let input = indoc::indoc! {"
        name: sched_switch
        ID: 308
        format:
        \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
        \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
        \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
        \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

        \tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;
        \tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
        \tfield:int prev_prio;\toffset:28;\tsize:4;\tsigned:1;

        print fmt: \"prev_comm=%s prev_pid=%d\", REC->prev_comm, REC->prev_pid
        "};
        let format = EventFormat::parse(input).unwrap();
        assert_eq!(format.name, "sched_switch");
        assert_eq!(format.id, 308);
        assert_eq!(format.common_field_count, 4);
        assert_eq!(format.fields.len(), 7);
        assert_eq!(format.payload_fields().len(), 3);
        assert_eq!(format.payload_fields()[0].name, "prev_comm");
        assert_eq!(format.payload_fields()[0].array, ArrayKind::Fixed);
    }

    #[test]
    fn missing_id_is_an_error() {
        let input = "name: foo\nformat:\n";
        assert!(matches!(
            EventFormat::parse(input),
            Err(FormatError::MissingId)
        ));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let input = "name: foo\nID: 7\nfuture_key: whatever\n";
        let format = EventFormat::parse(input).unwrap();
        assert_eq!(format.id, 7);
    }

    #[test]
    fn field_classification() {
        let field = |line| FormatField::parse(line).unwrap().unwrap();

        let f = field("\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;");
        assert_eq!(f.array, ArrayKind::None);
        assert_eq!(f.c_type, "unsigned short");
        assert_eq!(f.name, "common_type");
        assert_eq!((f.offset, f.size, f.signed), (0, 2, false));

        let f = field("\tfield:__data_loc char[] devname;\toffset:8;\tsize:4;\tsigned:0;");
        assert_eq!(f.array, ArrayKind::Loc4);
        assert_eq!(f.c_type, "__data_loc char[]");
        assert_eq!(f.name, "devname");

        let f = field("\tfield:__rel_loc u8[] payload;\toffset:8;\tsize:4;\tsigned:0;");
        assert_eq!(f.array, ArrayKind::Loc4);

        let f = field("\tfield:char comm[16];\toffset:8;\tsize:16;\tsigned:0;");
        assert_eq!(f.array, ArrayKind::Fixed);
        assert_eq!(f.c_type, "char[16]");
        assert_eq!(f.name, "comm");

        let f = field("\tfield:char buf[];\toffset:16;\tsize:0;\tsigned:0;");
        assert_eq!(f.array, ArrayKind::Trailing);
    }
}
