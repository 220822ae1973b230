//! Recursive-descent parser for `${...}` reference expressions.
//!
//! Grammar inside a marker:
//!
//! ```text
//! reference := ws* ident ( "." ident | "[" digits "]" )* ws*
//! ident     := [A-Za-z_] [A-Za-z0-9_-]*
//! ```
//!
//! The first identifier names the scope. A lone identifier that is not a
//! scope name is shorthand for an environment variable (`${DATA_DIR}`).

use std::fmt;

/// Namespace scope a reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Environment variables, with built-in directory defaults.
    Env,
    /// The pipeline's resolved `parameters` block.
    Parameters,
    /// The pipeline's resolved `metadata` block.
    Metadata,
    /// Engine-provided values such as `run_id` and `timestamp`.
    Builtin,
    /// Statistics accumulated by earlier steps.
    Statistics,
    /// Summaries of datasets produced by earlier steps.
    Datasets,
    /// Output files produced by earlier steps.
    Outputs,
}

impl Scope {
    /// Parses a scope name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "env" => Some(Self::Env),
            "parameters" => Some(Self::Parameters),
            "metadata" => Some(Self::Metadata),
            "builtin" => Some(Self::Builtin),
            "statistics" => Some(Self::Statistics),
            "datasets" => Some(Self::Datasets),
            "outputs" => Some(Self::Outputs),
            _ => None,
        }
    }

    /// Returns the scope name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Parameters => "parameters",
            Self::Metadata => "metadata",
            Self::Builtin => "builtin",
            Self::Statistics => "statistics",
            Self::Datasets => "datasets",
            Self::Outputs => "outputs",
        }
    }
}

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object member access.
    Key(String),
    /// Array element access.
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, ".{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The scope being read.
    pub scope: Scope,
    /// Path below the scope; never empty.
    pub path: Vec<Segment>,
    /// The marker exactly as written.
    pub source: String,
}

impl Reference {
    /// Returns the first path key, e.g. `a` for `${parameters.a.b}`.
    #[must_use]
    pub fn root_key(&self) -> Option<&str> {
        match self.path.first() {
            Some(Segment::Key(k)) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Text outside any marker.
    Literal(String),
    /// A well-formed reference.
    Reference(Reference),
    /// A marker that failed to parse; kept verbatim.
    Malformed {
        /// The marker text.
        text: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// A string split into literal text and reference markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    /// Parses a string.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let marker = &rest[start..];
            let (piece, consumed) = parse_marker(marker);
            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(piece);
            rest = &marker[consumed..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Self { pieces }
    }

    /// The parsed pieces in order.
    #[must_use]
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Returns true if the string holds at least one marker.
    #[must_use]
    pub fn has_markers(&self) -> bool {
        self.pieces.iter().any(|p| !matches!(p, Piece::Literal(_)))
    }

    /// Returns the reference if the whole string is exactly one marker.
    #[must_use]
    pub fn single_reference(&self) -> Option<&Reference> {
        match self.pieces.as_slice() {
            [Piece::Reference(r)] => Some(r),
            _ => None,
        }
    }

    /// Iterates over the well-formed references.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Reference(r) => Some(r),
            _ => None,
        })
    }
}

/// Parses one marker starting at `${`. Returns the piece and bytes consumed.
fn parse_marker(marker: &str) -> (Piece, usize) {
    let Some(close) = marker.find('}') else {
        return (
            Piece::Malformed {
                text: marker.to_string(),
                reason: "unterminated marker".to_string(),
            },
            marker.len(),
        );
    };

    let text = &marker[..=close];
    let body = &marker[2..close];
    let piece = match MarkerParser::new(body).parse() {
        Ok((scope, path)) => Piece::Reference(Reference {
            scope,
            path,
            source: text.to_string(),
        }),
        Err(reason) => Piece::Malformed {
            text: text.to_string(),
            reason,
        },
    };
    (piece, close + 1)
}

struct MarkerParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> MarkerParser<'a> {
    fn new(body: &'a str) -> Self {
        Self {
            src: body.trim().as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<(Scope, Vec<Segment>), String> {
        if self.src.is_empty() {
            return Err("empty marker".to_string());
        }

        let head = self.ident()?;
        let mut path = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                b'.' => {
                    self.pos += 1;
                    path.push(Segment::Key(self.ident()?));
                }
                b'[' => {
                    self.pos += 1;
                    path.push(Segment::Index(self.index()?));
                }
                other => {
                    return Err(format!(
                        "unexpected character '{}' at offset {}",
                        other as char, self.pos
                    ));
                }
            }
        }

        match Scope::from_name(&head) {
            Some(scope) if path.is_empty() => {
                Err(format!("scope '{}' needs a path", scope.as_str()))
            }
            Some(scope) => Ok((scope, path)),
            None if path.is_empty() => Ok((Scope::Env, vec![Segment::Key(head)])),
            None => Err(format!("unknown scope '{head}'")),
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.pos += 1,
            _ => return Err(format!("expected identifier at offset {start}")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn index(&mut self) -> Result<usize, String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(format!("expected index at offset {start}"));
        }
        let digits = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if self.peek() != Some(b']') {
            return Err(format!("expected ']' at offset {}", self.pos));
        }
        self.pos += 1;
        digits
            .parse()
            .map_err(|_| format!("index '{digits}' out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_string_has_no_markers() {
        let template = Template::parse("/data/file.csv");
        assert!(!template.has_markers());
        assert_eq!(
            template.pieces(),
            &[Piece::Literal("/data/file.csv".to_string())]
        );
    }

    #[test]
    fn test_single_reference_with_path() {
        let template = Template::parse("${metadata.source_files[0].path}");
        let reference = template.single_reference().unwrap();

        assert_eq!(reference.scope, Scope::Metadata);
        assert_eq!(
            reference.path,
            vec![
                Segment::Key("source_files".to_string()),
                Segment::Index(0),
                Segment::Key("path".to_string()),
            ]
        );
        assert_eq!(reference.root_key(), Some("source_files"));
    }

    #[test]
    fn test_embedded_references() {
        let template = Template::parse("${parameters.base}/x/${env.NAME}.csv");
        assert!(template.single_reference().is_none());
        assert_eq!(template.references().count(), 2);
        assert_eq!(template.pieces().len(), 4);
    }

    #[test]
    fn test_bare_identifier_is_env() {
        let template = Template::parse("${DATA_DIR}");
        let reference = template.single_reference().unwrap();
        assert_eq!(reference.scope, Scope::Env);
        assert_eq!(reference.root_key(), Some("DATA_DIR"));
    }

    #[test]
    fn test_whitespace_inside_marker() {
        let template = Template::parse("${ parameters.a }");
        assert_eq!(template.single_reference().unwrap().scope, Scope::Parameters);
    }

    #[test]
    fn test_unterminated_marker_is_malformed() {
        let template = Template::parse("prefix ${parameters.a");
        assert!(matches!(
            template.pieces()[1],
            Piece::Malformed { ref reason, .. } if reason == "unterminated marker"
        ));
    }

    #[test]
    fn test_malformed_markers() {
        for input in ["${}", "${parameters}", "${nope.x}", "${parameters.a[x]}", "${a b}"] {
            let template = Template::parse(input);
            assert!(
                matches!(template.pieces(), [Piece::Malformed { .. }]),
                "expected malformed for {input}"
            );
        }
    }

    #[test]
    fn test_dollar_without_brace_is_literal() {
        let template = Template::parse("cost $5 {ok}");
        assert!(!template.has_markers());
    }
}
