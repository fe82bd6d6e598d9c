//! Splitting migration scripts into statements
//!
//! Statements end at `;` outside of string literals, quoted identifiers, comments,
//! PostgreSQL dollar-quoted bodies and `BEGIN ... END` blocks (SQLite trigger
//! bodies, PostgreSQL `BEGIN ATOMIC` function bodies).

use crate::backend::Dialect;

/// Directive comment that makes a script run outside a transaction
///
/// Needed for statements PostgreSQL refuses inside a transaction block such as
/// `CREATE INDEX CONCURRENTLY` or `ALTER TYPE ... ADD VALUE`.
pub const NO_TRANSACTION_DIRECTIVE: &str = "tidemark:no-transaction";

/// A loaded migration script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    pub statements: Vec<String>,
    /// `false` when the script carries the no-transaction directive
    pub transactional: bool,
}

impl SqlScript {
    pub fn parse(content: &str, dialect: Dialect) -> Self {
        Self {
            statements: split_statements(content, dialect),
            transactional: !has_no_transaction_directive(content),
        }
    }
}

/// Whether the leading comment block of a script holds the no-transaction directive
pub fn has_no_transaction_directive(content: &str) -> bool {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.strip_prefix("--") {
            Some(comment) if comment.trim() == NO_TRANSACTION_DIRECTIVE => return true,
            Some(_) => continue,
            None => return false,
        }
    }
    false
}

#[derive(Debug)]
enum State {
    Normal,
    /// `escapes` is set for PostgreSQL `E'...'` literals, where `\` escapes the next byte
    SingleQuote { escapes: bool },
    DoubleQuote,
    LineComment,
    BlockComment(usize),
    Dollar(Vec<u8>),
}

/// Tracks `BEGIN ... END` nesting so `;` inside a block body does not split
struct BlockTracker {
    dialect: Dialect,
    word: String,
    leading: Vec<String>,
    last: Option<String>,
    is_trigger: bool,
    depth: usize,
}

impl BlockTracker {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            word: String::new(),
            leading: Vec::new(),
            last: None,
            is_trigger: false,
            depth: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.dialect);
    }

    fn push(&mut self, b: u8) {
        self.word.push(char::from(b));
    }

    fn end_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let word = self.word.to_ascii_uppercase();
        self.word.clear();

        if self.leading.len() < 3 {
            self.leading.push(word.clone());
            let leading: Vec<&str> = self.leading.iter().map(String::as_str).collect();
            if matches!(
                leading.as_slice(),
                ["CREATE", "TRIGGER"] | ["CREATE", "TEMP" | "TEMPORARY", "TRIGGER"]
            ) {
                self.is_trigger = true;
            }
        }

        let opens = match self.dialect {
            Dialect::Sqlite => self.is_trigger && word == "BEGIN",
            Dialect::Postgres => word == "ATOMIC" && self.last.as_deref() == Some("BEGIN"),
        };
        if opens || (self.depth > 0 && word == "CASE") {
            self.depth += 1;
        } else if self.depth > 0 && word == "END" {
            self.depth -= 1;
        }
        self.last = Some(word);
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Length of a `$tag$` opener at `i`, if one starts there
fn dollar_tag_len(bytes: &[u8], i: usize) -> Option<usize> {
    if i > 0 && (is_word_byte(bytes[i - 1]) || bytes[i - 1] == b'$') {
        return None;
    }
    let mut j = i + 1;
    match bytes.get(j) {
        Some(b'$') => return Some(2),
        Some(&b) if b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 => {}
        _ => return None,
    }
    while let Some(&b) = bytes.get(j) {
        if is_word_byte(b) || b >= 0x80 {
            j += 1;
        } else {
            break;
        }
    }
    (bytes.get(j) == Some(&b'$')).then(|| j - i + 1)
}

/// Split a script into executable statements, dropping empty ones
pub fn split_statements(sql: &str, dialect: Dialect) -> Vec<String> {
    let sql = sql.strip_prefix('\u{feff}').unwrap_or(sql);
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut state = State::Normal;
    let mut block = BlockTracker::new(dialect);
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    let mut flush = |from: usize, to: usize, has_code: bool| {
        let statement = sql[from..to].trim();
        if has_code && !statement.is_empty() {
            statements.push(statement.to_string());
        }
    };

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match &mut state {
            State::Normal => match b {
                b'\'' => {
                    let escapes = dialect == Dialect::Postgres && block.word.eq_ignore_ascii_case("e");
                    block.end_word();
                    has_code = true;
                    state = State::SingleQuote { escapes };
                }
                b'"' => {
                    block.end_word();
                    has_code = true;
                    state = State::DoubleQuote;
                }
                b'-' if next == Some(b'-') => {
                    block.end_word();
                    state = State::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    block.end_word();
                    state = State::BlockComment(1);
                    i += 1;
                }
                b'$' if dialect == Dialect::Postgres && dollar_tag_len(bytes, i).is_some() => {
                    block.end_word();
                    has_code = true;
                    let len = dollar_tag_len(bytes, i).unwrap_or(1);
                    state = State::Dollar(bytes[i..i + len].to_vec());
                    i += len;
                    continue;
                }
                b';' => {
                    block.end_word();
                    if block.depth == 0 {
                        flush(start, i, has_code);
                        start = i + 1;
                        has_code = false;
                        block.reset();
                    }
                }
                _ => {
                    if !b.is_ascii_whitespace() {
                        has_code = true;
                    }
                    if is_word_byte(b) {
                        block.push(b);
                    } else {
                        block.end_word();
                    }
                }
            },
            State::SingleQuote { escapes } => {
                if *escapes && b == b'\\' {
                    i += 1;
                } else if b == b'\'' {
                    if next == Some(b'\'') {
                        i += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuote => {
                if b == b'"' {
                    if next == Some(b'"') {
                        i += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if b == b'*' && next == Some(b'/') {
                    *depth -= 1;
                    i += 1;
                    if *depth == 0 {
                        state = State::Normal;
                    }
                } else if b == b'/' && next == Some(b'*') && dialect == Dialect::Postgres {
                    // PostgreSQL nests block comments, SQLite does not
                    *depth += 1;
                    i += 1;
                }
            }
            State::Dollar(tag) => {
                if bytes[i..].starts_with(tag) {
                    i += tag.len();
                    state = State::Normal;
                    continue;
                }
            }
        }
        i += 1;
    }

    block.end_word();
    flush(start, bytes.len(), has_code);
    statements
}
