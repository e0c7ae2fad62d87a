use crate::error::Diagnostic;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: usize,
    pub column: usize,
}

impl Pos {
    pub fn diag(self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.line, self.column, message)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Float(f32),
    Int(i32),
    Punct(&'static str),
    Eof,
}

#[derive(Clone, Debug)]
pub(crate) struct Token {
    pub tok: Tok,
    pub pos: Pos,
}

const TWO_CHAR: [&str; 6] = ["==", "!=", "<=", ">=", "&&", "||"];
const ONE_CHAR: [&str; 16] = [
    "(", ")", "{", "}", "<", ">", ",", ";", "=", "+", "-", "*", "/", "!", ".", ":",
];

struct Cursor {
    chars: Vec<char>,
    at: usize,
    line: usize,
    column: usize,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            at: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.at).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.at + n).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.at += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn skip_trivia(&mut self) -> Result<(), Diagnostic> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.pos();
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => return Err(start.diag("unterminated block comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self, pos: Pos) -> Result<Tok, Diagnostic> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_at(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+')
            {
                is_float = true;
                text.push(c);
                self.bump();
                if let Some(sign) = self.peek().filter(|s| *s == '-' || *s == '+') {
                    text.push(sign);
                    self.bump();
                }
                continue;
            } else {
                break;
            }
            self.bump();
        }
        if self.peek() == Some('f') {
            is_float = true;
            self.bump();
        }
        if is_float {
            text.parse::<f32>()
                .map(Tok::Float)
                .map_err(|_| pos.diag(format!("invalid float literal '{text}'")))
        } else {
            text.parse::<i32>()
                .map(Tok::Int)
                .map_err(|_| pos.diag(format!("integer literal '{text}' is out of range")))
        }
    }
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, Diagnostic> {
    let mut cur = Cursor::new(src);
    let mut out = Vec::new();
    loop {
        cur.skip_trivia()?;
        let pos = cur.pos();
        let Some(c) = cur.peek() else {
            out.push(Token { tok: Tok::Eof, pos });
            return Ok(out);
        };

        if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(c) = cur.peek().filter(|c| c.is_ascii_alphanumeric() || *c == '_') {
                ident.push(c);
                cur.bump();
            }
            out.push(Token {
                tok: Tok::Ident(ident),
                pos,
            });
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && cur.peek_at(1).is_some_and(|n| n.is_ascii_digit())) {
            let tok = cur.number(pos)?;
            out.push(Token { tok, pos });
            continue;
        }

        let pair: String = [Some(c), cur.peek_at(1)].into_iter().flatten().collect();
        if let Some(p) = TWO_CHAR.iter().find(|p| **p == pair) {
            cur.bump();
            cur.bump();
            out.push(Token {
                tok: Tok::Punct(*p),
                pos,
            });
            continue;
        }
        if let Some(p) = ONE_CHAR.iter().find(|p| p.starts_with(c)) {
            cur.bump();
            out.push(Token {
                tok: Tok::Punct(*p),
                pos,
            });
            continue;
        }

        return Err(pos.diag(format!("unexpected character '{c}'")));
    }
}
