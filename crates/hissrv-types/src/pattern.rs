use std::fmt;

/// 键模式解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("unterminated character class in pattern: {0}")]
    UnterminatedClass(String),
    #[error("dangling escape at end of pattern: {0}")]
    DanglingEscape(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnySeq,
    Class { negated: bool, items: Vec<ClassItem> },
}

impl Token {
    fn matches_char(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::AnySeq => false,
            Token::Class { negated, items } => {
                let hit = items.iter().any(|item| match item {
                    ClassItem::Char(x) => *x == c,
                    ClassItem::Range(lo, hi) => *lo <= c && c <= *hi,
                });
                hit != *negated
            }
        }
    }
}

/// Redis 风格的 glob 键模式（`*`、`?`、`[abc]`、`[a-z]`、`[^x]`、`\` 转义）
///
/// 订阅模式直接作为 SCAN MATCH 参数下发，排除模式则在本地对键求值，
/// 两者语义保持一致。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    source: String,
    tokens: Vec<Token>,
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    // 连续的 * 等价于一个
                    if tokens.last() != Some(&Token::AnySeq) {
                        tokens.push(Token::AnySeq);
                    }
                }
                '?' => tokens.push(Token::AnyChar),
                '\\' => match chars.next() {
                    Some(escaped) => tokens.push(Token::Literal(escaped)),
                    None => return Err(PatternError::DanglingEscape(pattern.to_string())),
                },
                '[' => {
                    let mut negated = false;
                    if chars.peek() == Some(&'^') {
                        negated = true;
                        chars.next();
                    }
                    let mut items = Vec::new();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            ']' => {
                                closed = true;
                                break;
                            }
                            '\\' => match chars.next() {
                                Some(escaped) => items.push(ClassItem::Char(escaped)),
                                None => {
                                    return Err(PatternError::DanglingEscape(pattern.to_string()))
                                }
                            },
                            lo => {
                                let mut lookahead = chars.clone();
                                match (lookahead.next(), lookahead.next()) {
                                    (Some('-'), Some(hi)) if hi != ']' => {
                                        chars.next();
                                        chars.next();
                                        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                                        items.push(ClassItem::Range(lo, hi));
                                    }
                                    _ => items.push(ClassItem::Char(lo)),
                                }
                            }
                        }
                    }
                    if !closed {
                        return Err(PatternError::UnterminatedClass(pattern.to_string()));
                    }
                    tokens.push(Token::Class { negated, items });
                }
                literal => tokens.push(Token::Literal(literal)),
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, key: &str) -> bool {
        let text: Vec<char> = key.chars().collect();
        let (mut t, mut p) = (0usize, 0usize);
        // 最近一个 * 的位置，以及它当前吞下的文本终点
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            if let Some(token) = self.tokens.get(p) {
                if *token == Token::AnySeq {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                if token.matches_char(text[t]) {
                    p += 1;
                    t += 1;
                    continue;
                }
            }
            match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            }
        }

        self.tokens[p..].iter().all(|token| *token == Token::AnySeq)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
