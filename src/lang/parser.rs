use super::error::ParseError;

/// Raw syntax tree produced by the reader, before analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum Sexp {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Keyword(String),
    Symbol(String),
    List(Vec<Sexp>),
    Vector(Vec<Sexp>),
    Map(Vec<(Sexp, Sexp)>),
    Set(Vec<Sexp>),
}

impl Sexp {
    /// Short rendering used in analyzer error paths.
    pub fn describe(&self) -> String {
        match self {
            Sexp::Nil => "nil".into(),
            Sexp::Bool(b) => b.to_string(),
            Sexp::Int(i) => i.to_string(),
            Sexp::Float(f) => f.to_string(),
            Sexp::Str(s) => format!("{s:?}"),
            Sexp::Keyword(k) => format!(":{k}"),
            Sexp::Symbol(s) => s.clone(),
            Sexp::List(items) => match items.first() {
                Some(head) => format!("({} ...)", head.describe()),
                None => "()".into(),
            },
            Sexp::Vector(_) => "[...]".into(),
            Sexp::Map(_) => "{...}".into(),
            Sexp::Set(_) => "#{...}".into(),
        }
    }
}

/// Reads a whole program. Multiple top-level forms are accepted and wrapped
/// in an implicit `(do ...)`.
pub fn parse(source: &str) -> Result<Sexp, ParseError> {
    let mut reader = Reader::new(source);
    let mut forms = Vec::new();
    loop {
        reader.skip_whitespace();
        if reader.at_end() {
            break;
        }
        forms.push(reader.read_form()?);
    }
    match forms.len() {
        0 => Err(ParseError::new(
            reader.line,
            reader.col,
            "empty program; expected at least one expression",
        )),
        1 => Ok(forms.pop().unwrap_or(Sexp::Nil)),
        _ => {
            let mut list = vec![Sexp::Symbol("do".into())];
            list.extend(forms);
            Ok(Sexp::List(list))
        }
    }
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Reader {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, hint: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.col, hint)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' {
                self.advance();
            } else if c == ';' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_form(&mut self) -> Result<Sexp, ParseError> {
        self.skip_whitespace();
        let Some(c) = self.peek() else {
            return Err(self.error("unexpected end of input"));
        };
        match c {
            '(' => self.read_seq(')').map(Sexp::List),
            '[' => self.read_seq(']').map(Sexp::Vector),
            '{' => self.read_map(),
            // The set alternative must be tried before anything else behind
            // the dispatch character.
            '#' if self.peek_at(1) == Some('{') => self.read_set(),
            '"' => self.read_string(),
            ':' => self.read_keyword(),
            ')' | ']' | '}' => Err(self.error(format!("unexpected closing '{c}'"))),
            _ => self.read_atom(),
        }
    }

    fn read_seq(&mut self, close: char) -> Result<Vec<Sexp>, ParseError> {
        let (open_line, open_col) = (self.line, self.col);
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(c) if c == close => {
                    self.advance();
                    return Ok(items);
                }
                Some(_) => items.push(self.read_form()?),
                None => {
                    return Err(ParseError::new(
                        open_line,
                        open_col,
                        format!("unclosed delimiter; expected '{close}'"),
                    ))
                }
            }
        }
    }

    fn read_map(&mut self) -> Result<Sexp, ParseError> {
        let (open_line, open_col) = (self.line, self.col);
        let items = self.read_seq('}')?;
        if items.len() % 2 != 0 {
            return Err(ParseError::new(
                open_line,
                open_col,
                "map literal requires an even number of forms",
            ));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Ok(Sexp::Map(pairs))
    }

    fn read_set(&mut self) -> Result<Sexp, ParseError> {
        self.advance(); // '#'
        self.read_seq('}').map(Sexp::Set)
    }

    fn read_string(&mut self) -> Result<Sexp, ParseError> {
        let (open_line, open_col) = (self.line, self.col);
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(Sexp::Str(out)),
                Some('\\') => match self.advance() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        return Err(self.error(format!("unknown escape '\\{other}'")));
                    }
                    None => {
                        return Err(ParseError::new(open_line, open_col, "unterminated string"))
                    }
                },
                Some(c) => out.push(c),
                None => return Err(ParseError::new(open_line, open_col, "unterminated string")),
            }
        }
    }

    fn read_keyword(&mut self) -> Result<Sexp, ParseError> {
        self.advance(); // ':'
        let name = self.read_token();
        if name.is_empty() {
            return Err(self.error("expected a name after ':'"));
        }
        Ok(Sexp::Keyword(name))
    }

    fn read_atom(&mut self) -> Result<Sexp, ParseError> {
        let token = self.read_token();
        if token.is_empty() {
            let c = self.peek().unwrap_or(' ');
            return Err(self.error(format!("unexpected character '{c}'")));
        }
        Ok(match token.as_str() {
            "nil" => Sexp::Nil,
            "true" => Sexp::Bool(true),
            "false" => Sexp::Bool(false),
            _ => {
                if let Ok(i) = token.parse::<i64>() {
                    Sexp::Int(i)
                } else if looks_numeric(&token) {
                    match token.parse::<f64>() {
                        Ok(f) => Sexp::Float(f),
                        Err(_) => {
                            return Err(self.error(format!("malformed number '{token}'")));
                        }
                    }
                } else {
                    Sexp::Symbol(token)
                }
            }
        })
    }

    fn read_token(&mut self) -> String {
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, ',' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';')
            {
                break;
            }
            token.push(c);
            self.advance();
        }
        token
    }
}

fn looks_numeric(token: &str) -> bool {
    let rest = token.strip_prefix('-').unwrap_or(token);
    rest.chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_literals() {
        assert_eq!(parse("nil").unwrap(), Sexp::Nil);
        assert_eq!(parse("true").unwrap(), Sexp::Bool(true));
        assert_eq!(parse("-42").unwrap(), Sexp::Int(-42));
        assert_eq!(parse("3.5").unwrap(), Sexp::Float(3.5));
        assert_eq!(parse(r#""a\nb""#).unwrap(), Sexp::Str("a\nb".into()));
        assert_eq!(parse(":name").unwrap(), Sexp::Keyword("name".into()));
    }

    #[test]
    fn set_literal_wins_over_map_dispatch() {
        let parsed = parse("#{1 2}").unwrap();
        assert_eq!(parsed, Sexp::Set(vec![Sexp::Int(1), Sexp::Int(2)]));
    }

    #[test]
    fn commas_are_whitespace() {
        let parsed = parse("{:a 1, :b 2}").unwrap();
        assert_eq!(
            parsed,
            Sexp::Map(vec![
                (Sexp::Keyword("a".into()), Sexp::Int(1)),
                (Sexp::Keyword("b".into()), Sexp::Int(2)),
            ])
        );
    }

    #[test]
    fn odd_map_literal_fails() {
        assert!(parse("{:a}").is_err());
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let parsed = parse("; intro\n(+ 1 2) ; trailing").unwrap();
        assert_eq!(
            parsed,
            Sexp::List(vec![Sexp::Symbol("+".into()), Sexp::Int(1), Sexp::Int(2)])
        );
    }

    #[test]
    fn multiple_forms_wrap_in_do() {
        let parsed = parse("(def x 1) x").unwrap();
        let Sexp::List(items) = parsed else {
            panic!("expected list")
        };
        assert_eq!(items[0], Sexp::Symbol("do".into()));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn unclosed_delimiter_reports_opening_position() {
        let err = parse("(+ 1").unwrap_err();
        assert_eq!((err.line, err.col), (1, 1));
        assert!(err.hint.contains("unclosed"));
    }

    #[test]
    fn namespaced_symbols_survive() {
        assert_eq!(
            parse("data/users").unwrap(),
            Sexp::Symbol("data/users".into())
        );
    }
}
