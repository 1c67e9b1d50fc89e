use crate::jinja::ast::{BinaryOp, Expr, MacroParam, Stmt, Target, UnaryOp};
use serde_json::{Number, Value};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    fn new(line: u32, message: impl Into<String>) -> ParseError {
        ParseError {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Text(String),
    VarBegin,
    VarEnd,
    BlockBegin,
    BlockEnd,
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Dot,
    Comma,
    Colon,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Tilde,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Eof,
}

#[derive(Clone, Debug)]
struct TokenWithLine {
    token: Token,
    line: u32,
}

struct Tokenizer<'a> {
    chars: Vec<char>,
    source: &'a str,
    pos: usize,
    line: u32,
    tokens: Vec<TokenWithLine>,
}

fn tokenize(source: &str) -> Result<Vec<TokenWithLine>, ParseError> {
    let mut tokenizer = Tokenizer {
        chars: source.chars().collect(),
        source,
        pos: 0,
        line: 1,
        tokens: Vec::new(),
    };
    tokenizer.run()?;
    Ok(tokenizer.tokens)
}

impl Tokenizer<'_> {
    fn run(&mut self) -> Result<(), ParseError> {
        while self.pos < self.chars.len() {
            if self.starts_with("{{") {
                self.open_tag(Token::VarBegin, Token::VarEnd, "}}")?;
            } else if self.starts_with("{%") {
                self.block_tag()?;
            } else if self.starts_with("{#") {
                self.skip_comment()?;
            } else {
                self.text_until_tag();
            }
        }
        self.push(Token::Eof);
        Ok(())
    }

    fn starts_with(&self, pat: &str) -> bool {
        let mut chars = pat.chars();
        let mut pos = self.pos;
        loop {
            let Some(expected) = chars.next() else {
                return true;
            };
            if self.chars.get(pos) != Some(&expected) {
                return false;
            }
            pos += 1;
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied();
        if let Some(ch) = ch {
            self.pos += 1;
            if ch == '\n' {
                self.line += 1;
            }
        }
        ch
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(TokenWithLine {
            token,
            line: self.line,
        });
    }

    fn text_until_tag(&mut self) {
        let line = self.line;
        let mut data = String::new();
        while self.pos < self.chars.len()
            && !self.starts_with("{{")
            && !self.starts_with("{%")
            && !self.starts_with("{#")
        {
            if let Some(ch) = self.bump() {
                data.push(ch);
            }
        }
        self.tokens.push(TokenWithLine {
            token: Token::Text(data),
            line,
        });
    }

    fn skip_comment(&mut self) -> Result<(), ParseError> {
        let line = self.line;
        self.pos += 2;
        while self.pos < self.chars.len() {
            if self.starts_with("#}") {
                self.pos += 2;
                return Ok(());
            }
            self.bump();
        }
        Err(ParseError::new(line, "unterminated comment"))
    }

    /// `{% ... %}` including the `raw` tag, which turns everything up to the
    /// matching `{% endraw %}` into template data.
    fn block_tag(&mut self) -> Result<(), ParseError> {
        let tag_start = self.tokens.len();
        self.open_tag(Token::BlockBegin, Token::BlockEnd, "%}")?;
        let inner: Vec<&Token> = self.tokens[tag_start..]
            .iter()
            .map(|t| &t.token)
            .collect();
        if inner.len() == 3 && *inner[1] == Token::Ident("raw".to_string()) {
            self.tokens.truncate(tag_start);
            self.raw_until_endraw()?;
        }
        Ok(())
    }

    fn raw_until_endraw(&mut self) -> Result<(), ParseError> {
        let line = self.line;
        let mut data = String::new();
        while self.pos < self.chars.len() {
            if self.starts_with("{%") {
                let lookahead = &self.source[self.char_to_byte(self.pos)..];
                let rest = lookahead[2..].trim_start_matches('-').trim_start();
                if rest.starts_with("endraw") {
                    // consume the end tag without emitting tokens
                    let tag_start = self.tokens.len();
                    self.open_tag(Token::BlockBegin, Token::BlockEnd, "%}")?;
                    self.tokens.truncate(tag_start);
                    self.tokens.push(TokenWithLine {
                        token: Token::Text(data),
                        line,
                    });
                    return Ok(());
                }
            }
            if let Some(ch) = self.bump() {
                data.push(ch);
            }
        }
        Err(ParseError::new(line, "unterminated raw block"))
    }

    fn char_to_byte(&self, char_pos: usize) -> usize {
        self.source
            .char_indices()
            .nth(char_pos)
            .map(|(i, _)| i)
            .unwrap_or(self.source.len())
    }

    fn open_tag(&mut self, begin: Token, end: Token, close: &str) -> Result<(), ParseError> {
        self.push(begin);
        self.pos += 2;
        // whitespace-control marker
        if self.chars.get(self.pos) == Some(&'-') {
            self.pos += 1;
        }
        // brackets opened inside the tag shadow the closing delimiter
        let mut depth = 0usize;
        loop {
            self.skip_tag_whitespace();
            if self.pos >= self.chars.len() {
                return Err(ParseError::new(self.line, format!("expected `{close}`")));
            }
            if depth == 0 {
                if self.chars[self.pos] == '-' && self.starts_with_at(self.pos + 1, close) {
                    self.pos += 1 + close.len();
                    self.push(end);
                    return Ok(());
                }
                if self.starts_with(close) {
                    self.pos += close.len();
                    self.push(end);
                    return Ok(());
                }
            }
            self.tag_token()?;
            match self.tokens.last().map(|t| &t.token) {
                Some(Token::LParen | Token::LBracket | Token::LBrace) => depth += 1,
                Some(Token::RParen | Token::RBracket | Token::RBrace) => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
        }
    }

    fn starts_with_at(&self, pos: usize, pat: &str) -> bool {
        pat.chars()
            .enumerate()
            .all(|(i, expected)| self.chars.get(pos + i) == Some(&expected))
    }

    fn skip_tag_whitespace(&mut self) {
        while self
            .chars
            .get(self.pos)
            .is_some_and(|ch| ch.is_whitespace())
        {
            self.bump();
        }
    }

    fn tag_token(&mut self) -> Result<(), ParseError> {
        let ch = self.chars[self.pos];
        if ch.is_ascii_alphabetic() || ch == '_' {
            let mut ident = String::new();
            while self
                .chars
                .get(self.pos)
                .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
            {
                ident.push(self.chars[self.pos]);
                self.pos += 1;
            }
            self.push(Token::Ident(ident));
            return Ok(());
        }
        if ch.is_ascii_digit() {
            return self.number_token();
        }
        if ch == '\'' || ch == '"' {
            return self.string_token(ch);
        }

        let two: String = self.chars[self.pos..]
            .iter()
            .take(2)
            .collect();
        let token = match two.as_str() {
            "==" => Some(Token::EqEq),
            "!=" => Some(Token::NotEq),
            "<=" => Some(Token::Lte),
            ">=" => Some(Token::Gte),
            "**" => Some(Token::DoubleStar),
            "//" => Some(Token::DoubleSlash),
            _ => None,
        };
        if let Some(token) = token {
            self.pos += 2;
            self.push(token);
            return Ok(());
        }

        let token = match ch {
            '.' => Token::Dot,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '|' => Token::Pipe,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '~' => Token::Tilde,
            '=' => Token::Assign,
            '<' => Token::Lt,
            '>' => Token::Gt,
            other => {
                return Err(ParseError::new(
                    self.line,
                    format!("unexpected character `{other}`"),
                ))
            }
        };
        self.pos += 1;
        self.push(token);
        Ok(())
    }

    fn number_token(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        while self.chars.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.chars.get(self.pos) == Some(&'.')
            && self
                .chars
                .get(self.pos + 1)
                .is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.pos += 1;
            while self.chars.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| ParseError::new(self.line, format!("invalid number `{text}`")))?;
            self.push(Token::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| ParseError::new(self.line, format!("invalid number `{text}`")))?;
            self.push(Token::Int(value));
        }
        Ok(())
    }

    fn string_token(&mut self, quote: char) -> Result<(), ParseError> {
        let line = self.line;
        self.pos += 1;
        let mut text = String::new();
        loop {
            let Some(ch) = self.bump() else {
                return Err(ParseError::new(line, "unterminated string literal"));
            };
            if ch == quote {
                break;
            }
            if ch == '\\' {
                let Some(escaped) = self.bump() else {
                    return Err(ParseError::new(line, "unterminated string literal"));
                };
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    other => text.push(other),
                }
            } else {
                text.push(ch);
            }
        }
        self.push(Token::Str(text));
        Ok(())
    }
}

/// Parses a template into its statement list.
pub fn parse(source: &str) -> Result<Vec<Stmt>, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, index: 0 };
    let body = parser.parse_body(&[])?;
    parser.expect(Token::Eof)?;
    Ok(body)
}

struct Parser {
    tokens: Vec<TokenWithLine>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.index)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.index + offset)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.index)
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        if self.match_token(&token) {
            Ok(())
        } else {
            Err(ParseError::new(
                self.line(),
                format!("expected {token:?}, found {:?}", self.peek()),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(ParseError::new(
                self.line(),
                format!("expected identifier, found {other:?}"),
            )),
        }
    }

    fn match_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Token::Ident(name) if name == keyword) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.match_keyword(keyword) {
            Ok(())
        } else {
            Err(ParseError::new(
                self.line(),
                format!("expected `{keyword}`, found {:?}", self.peek()),
            ))
        }
    }

    /// The keyword of the upcoming `{% ... %}` tag, without consuming it.
    fn peek_block_keyword(&self) -> Option<&str> {
        if *self.peek() != Token::BlockBegin {
            return None;
        }
        match self.peek_at(1) {
            Token::Ident(name) => Some(name),
            _ => None,
        }
    }

    fn parse_body(&mut self, terminators: &[&str]) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            if let Some(keyword) = self.peek_block_keyword() {
                if terminators.contains(&keyword) {
                    return Ok(body);
                }
            }
            match self.peek().clone() {
                Token::Eof => {
                    if terminators.is_empty() {
                        return Ok(body);
                    }
                    return Err(ParseError::new(self.line(), "unexpected end of template"));
                }
                Token::Text(data) => {
                    let line = self.line();
                    self.advance();
                    body.push(Stmt::Text { data, line });
                }
                Token::VarBegin => {
                    let line = self.line();
                    self.advance();
                    let expr = self.parse_expression()?;
                    self.expect(Token::VarEnd)?;
                    body.push(Stmt::Output { expr, line });
                }
                Token::BlockBegin => {
                    body.push(self.parse_statement()?);
                }
                other => {
                    return Err(ParseError::new(
                        self.line(),
                        format!("unexpected {other:?}"),
                    ));
                }
            }
        }
    }

    /// Consumes the closing tag of a construct, e.g. `{% endfor %}`.
    fn close_tag(&mut self, keyword: &str) -> Result<(), ParseError> {
        self.expect(Token::BlockBegin)?;
        self.expect_keyword(keyword)?;
        // `{% endblock name %}` carries an optional repeated name
        if keyword == "endblock" {
            if let Token::Ident(_) = self.peek() {
                self.advance();
            }
        }
        self.expect(Token::BlockEnd)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(Token::BlockBegin)?;
        let keyword = self.expect_ident()?;
        match keyword.as_str() {
            "if" => self.parse_if(line),
            "for" => self.parse_for(line),
            "set" => self.parse_set(line),
            "with" => self.parse_with(line),
            "macro" => self.parse_macro(line),
            "filter" => self.parse_filter_block(line),
            "include" => self.parse_include(line),
            "import" => self.parse_import(line),
            "from" => self.parse_from_import(line),
            "extends" => {
                let template = self.parse_expression()?;
                self.expect(Token::BlockEnd)?;
                Ok(Stmt::Extends { template, line })
            }
            "block" => {
                let name = self.expect_ident()?;
                self.expect(Token::BlockEnd)?;
                let body = self.parse_body(&["endblock"])?;
                self.close_tag("endblock")?;
                Ok(Stmt::Block { name, body, line })
            }
            other => Err(ParseError::new(line, format!("unknown tag `{other}`"))),
        }
    }

    fn parse_if(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let test = self.parse_expression()?;
        self.expect(Token::BlockEnd)?;
        let body = self.parse_body(&["elif", "else", "endif"])?;

        let else_line = self.line();
        self.expect(Token::BlockBegin)?;
        let keyword = self.expect_ident()?;
        let else_body = match keyword.as_str() {
            "elif" => {
                // fold the chain into a nested if
                vec![self.parse_if(else_line)?]
            }
            "else" => {
                self.expect(Token::BlockEnd)?;
                let body = self.parse_body(&["endif"])?;
                self.close_tag("endif")?;
                body
            }
            "endif" => {
                self.expect(Token::BlockEnd)?;
                Vec::new()
            }
            other => {
                return Err(ParseError::new(
                    else_line,
                    format!("expected `elif`, `else` or `endif`, found `{other}`"),
                ))
            }
        };
        Ok(Stmt::If {
            test,
            body,
            else_body,
            line,
        })
    }

    fn parse_for(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let target = self.parse_target()?;
        self.expect_keyword("in")?;
        let iter = self.parse_or()?;
        // `for x in xs if cond` filters iterations; for shape purposes the
        // condition behaves like an if around the body.
        let loop_filter = if self.match_keyword("if") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.match_keyword("recursive");
        self.expect(Token::BlockEnd)?;
        let mut body = self.parse_body(&["else", "endfor"])?;

        let tail_line = self.line();
        self.expect(Token::BlockBegin)?;
        let keyword = self.expect_ident()?;
        let else_body = match keyword.as_str() {
            "else" => {
                self.expect(Token::BlockEnd)?;
                let body = self.parse_body(&["endfor"])?;
                self.close_tag("endfor")?;
                body
            }
            "endfor" => {
                self.expect(Token::BlockEnd)?;
                Vec::new()
            }
            other => {
                return Err(ParseError::new(
                    tail_line,
                    format!("expected `else` or `endfor`, found `{other}`"),
                ))
            }
        };

        if let Some(test) = loop_filter {
            let test_line = test.line();
            body = vec![Stmt::If {
                test,
                body,
                else_body: Vec::new(),
                line: test_line,
            }];
        }

        Ok(Stmt::For {
            target,
            iter,
            body,
            else_body,
            line,
        })
    }

    fn parse_target(&mut self) -> Result<Target, ParseError> {
        let line = self.line();
        let parenthesized = self.match_token(&Token::LParen);
        let first = self.expect_ident()?;
        let mut names = vec![first];
        while self.match_token(&Token::Comma) {
            names.push(self.expect_ident()?);
        }
        if parenthesized {
            self.expect(Token::RParen)?;
        }
        if names.len() == 1 && !parenthesized {
            Ok(Target::Name {
                name: names.remove(0),
                line,
            })
        } else {
            Ok(Target::Tuple { names, line })
        }
    }

    fn parse_set(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let target = self.parse_target()?;
        if self.match_token(&Token::Assign) {
            let value = self.parse_expression()?;
            self.expect(Token::BlockEnd)?;
            return Ok(Stmt::Set {
                target,
                value,
                line,
            });
        }

        let name = match target {
            Target::Name { name, .. } => name,
            Target::Tuple { .. } => {
                return Err(ParseError::new(
                    line,
                    "block assignment takes a single name",
                ))
            }
        };
        let filter = if self.match_token(&Token::Pipe) {
            Some(self.expect_ident()?)
        } else {
            None
        };
        self.expect(Token::BlockEnd)?;
        let body = self.parse_body(&["endset"])?;
        self.close_tag("endset")?;
        Ok(Stmt::SetBlock {
            name,
            filter,
            body,
            line,
        })
    }

    fn parse_with(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let mut bindings = Vec::new();
        while *self.peek() != Token::BlockEnd {
            if !bindings.is_empty() {
                self.expect(Token::Comma)?;
            }
            let name = self.expect_ident()?;
            self.expect(Token::Assign)?;
            let value = self.parse_expression()?;
            bindings.push((name, value));
        }
        self.expect(Token::BlockEnd)?;
        let body = self.parse_body(&["endwith"])?;
        self.close_tag("endwith")?;
        Ok(Stmt::With {
            bindings,
            body,
            line,
        })
    }

    fn parse_macro(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        while *self.peek() != Token::RParen {
            if !params.is_empty() {
                self.expect(Token::Comma)?;
            }
            let param = self.expect_ident()?;
            let default = if self.match_token(&Token::Assign) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(MacroParam {
                name: param,
                default,
            });
        }
        self.expect(Token::RParen)?;
        self.expect(Token::BlockEnd)?;
        let body = self.parse_body(&["endmacro"])?;
        self.close_tag("endmacro")?;
        Ok(Stmt::Macro {
            name,
            params,
            body,
            line,
        })
    }

    fn parse_filter_block(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let name = self.expect_ident()?;
        let mut args = Vec::new();
        if self.match_token(&Token::LParen) {
            while *self.peek() != Token::RParen {
                if !args.is_empty() {
                    self.expect(Token::Comma)?;
                }
                args.push(self.parse_expression()?);
            }
            self.expect(Token::RParen)?;
        }
        self.expect(Token::BlockEnd)?;
        let body = self.parse_body(&["endfilter"])?;
        self.close_tag("endfilter")?;
        Ok(Stmt::FilterBlock {
            name,
            args,
            body,
            line,
        })
    }

    fn parse_include(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let template = self.parse_expression()?;
        let mut ignore_missing = false;
        if self.match_keyword("ignore") {
            self.expect_keyword("missing")?;
            ignore_missing = true;
        }
        self.skip_context_modifier();
        self.expect(Token::BlockEnd)?;
        Ok(Stmt::Include {
            template,
            ignore_missing,
            line,
        })
    }

    fn parse_import(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let template = self.parse_expression()?;
        self.expect_keyword("as")?;
        let alias = self.expect_ident()?;
        self.skip_context_modifier();
        self.expect(Token::BlockEnd)?;
        Ok(Stmt::Import {
            template,
            alias,
            line,
        })
    }

    fn parse_from_import(&mut self, line: u32) -> Result<Stmt, ParseError> {
        let template = self.parse_expression()?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let alias = if self.match_keyword("as") {
                Some(self.expect_ident()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.skip_context_modifier();
        self.expect(Token::BlockEnd)?;
        Ok(Stmt::FromImport {
            template,
            names,
            line,
        })
    }

    fn skip_context_modifier(&mut self) {
        let saved = self.index;
        if self.match_keyword("with") || self.match_keyword("without") {
            if !self.match_keyword("context") {
                self.index = saved;
            }
        }
    }

    // Expressions, loosest binding first.

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_or()?;
        if self.match_keyword("if") {
            let line = expr.line();
            let test = self.parse_or()?;
            let otherwise = if self.match_keyword("else") {
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            return Ok(Expr::CondExpr {
                test: Box::new(test),
                then: Box::new(expr),
                otherwise,
                line,
            });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while self.match_keyword("or") {
            let line = expr.line();
            let rhs = self.parse_and()?;
            expr = Expr::BinOp {
                op: BinaryOp::Or,
                left: Box::new(expr),
                right: Box::new(rhs),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_not()?;
        while self.match_keyword("and") {
            let line = expr.line();
            let rhs = self.parse_not()?;
            expr = Expr::BinOp {
                op: BinaryOp::And,
                left: Box::new(expr),
                right: Box::new(rhs),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Token::Ident(name) if name == "not")
            && !matches!(self.peek_at(1), Token::Ident(name) if name == "in")
        {
            let line = self.line();
            self.advance();
            let node = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                node: Box::new(node),
                line,
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_add()?;
        loop {
            let op = if self.match_token(&Token::EqEq) {
                Some(BinaryOp::Eq)
            } else if self.match_token(&Token::NotEq) {
                Some(BinaryOp::Ne)
            } else if self.match_token(&Token::Lte) {
                Some(BinaryOp::Lte)
            } else if self.match_token(&Token::Gte) {
                Some(BinaryOp::Gte)
            } else if self.match_token(&Token::Lt) {
                Some(BinaryOp::Lt)
            } else if self.match_token(&Token::Gt) {
                Some(BinaryOp::Gt)
            } else if self.match_keyword("in") {
                Some(BinaryOp::In)
            } else if matches!(self.peek(), Token::Ident(name) if name == "not")
                && matches!(self.peek_at(1), Token::Ident(name) if name == "in")
            {
                self.advance();
                self.advance();
                Some(BinaryOp::NotIn)
            } else {
                None
            };
            let Some(op) = op else {
                break;
            };
            let line = expr.line();
            let rhs = self.parse_add()?;
            expr = Expr::BinOp {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_concat()?;
        loop {
            let op = if self.match_token(&Token::Plus) {
                Some(BinaryOp::Add)
            } else if self.match_token(&Token::Minus) {
                Some(BinaryOp::Sub)
            } else {
                None
            };
            let Some(op) = op else {
                break;
            };
            let line = expr.line();
            let rhs = self.parse_concat()?;
            expr = Expr::BinOp {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_mul()?;
        if *self.peek() != Token::Tilde {
            return Ok(expr);
        }
        let line = expr.line();
        let mut nodes = vec![expr];
        while self.match_token(&Token::Tilde) {
            nodes.push(self.parse_mul()?);
        }
        Ok(Expr::Concat { nodes, line })
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_pow()?;
        loop {
            let op = if self.match_token(&Token::Star) {
                Some(BinaryOp::Mul)
            } else if self.match_token(&Token::Slash) {
                Some(BinaryOp::Div)
            } else if self.match_token(&Token::DoubleSlash) {
                Some(BinaryOp::FloorDiv)
            } else if self.match_token(&Token::Percent) {
                Some(BinaryOp::Mod)
            } else {
                None
            };
            let Some(op) = op else {
                break;
            };
            let line = expr.line();
            let rhs = self.parse_pow()?;
            expr = Expr::BinOp {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_pow(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        while self.match_token(&Token::DoubleStar) {
            let line = expr.line();
            let rhs = self.parse_unary()?;
            expr = Expr::BinOp {
                op: BinaryOp::Pow,
                left: Box::new(expr),
                right: Box::new(rhs),
                line,
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        if self.match_token(&Token::Minus) {
            let node = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                node: Box::new(node),
                line,
            });
        }
        if self.match_token(&Token::Plus) {
            let node = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Pos,
                node: Box::new(node),
                line,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.match_token(&Token::Dot) {
                let line = expr.line();
                let attr = self.expect_ident()?;
                expr = Expr::Getattr {
                    node: Box::new(expr),
                    attr,
                    line,
                };
            } else if self.match_token(&Token::LBracket) {
                expr = self.parse_subscript(expr)?;
            } else if self.match_token(&Token::LParen) {
                expr = self.parse_call(expr)?;
            } else if self.match_token(&Token::Pipe) {
                expr = self.parse_filter(expr)?;
            } else if self.match_keyword("is") {
                expr = self.parse_test(expr)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_subscript(&mut self, node: Expr) -> Result<Expr, ParseError> {
        let line = node.line();
        let mut parts: Vec<Option<Expr>> = Vec::new();
        let mut current: Option<Expr> = None;
        let mut is_slice = false;
        loop {
            match self.peek() {
                Token::Colon => {
                    self.advance();
                    is_slice = true;
                    parts.push(current.take());
                }
                Token::RBracket => {
                    self.advance();
                    parts.push(current.take());
                    break;
                }
                _ => {
                    current = Some(self.parse_expression()?);
                }
            }
        }
        let index = if is_slice {
            let mut slots = parts.into_iter();
            Expr::Slice {
                start: slots.next().flatten().map(Box::new),
                stop: slots.next().flatten().map(Box::new),
                step: slots.next().flatten().map(Box::new),
                line,
            }
        } else {
            match parts.into_iter().next().flatten() {
                Some(expr) => expr,
                None => return Err(ParseError::new(line, "empty subscript")),
            }
        };
        Ok(Expr::Getitem {
            node: Box::new(node),
            index: Box::new(index),
            line,
        })
    }

    fn parse_call(&mut self, callee: Expr) -> Result<Expr, ParseError> {
        let line = callee.line();
        let (args, kwargs) = self.parse_call_args()?;
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            kwargs,
            line,
        })
    }

    /// Argument list after a consumed `(`, through the closing `)`.
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while *self.peek() != Token::RParen {
            if !(args.is_empty() && kwargs.is_empty()) {
                self.expect(Token::Comma)?;
            }
            if let (Token::Ident(name), Token::Assign) = (self.peek(), self.peek_at(1)) {
                let name = name.clone();
                self.advance();
                self.advance();
                kwargs.push((name, self.parse_expression()?));
            } else {
                args.push(self.parse_expression()?);
            }
        }
        self.expect(Token::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_filter(&mut self, node: Expr) -> Result<Expr, ParseError> {
        let line = node.line();
        let name = self.expect_ident()?;
        let (args, kwargs) = if self.match_token(&Token::LParen) {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(Expr::Filter {
            node: Box::new(node),
            name,
            args,
            kwargs,
            line,
        })
    }

    fn parse_test(&mut self, node: Expr) -> Result<Expr, ParseError> {
        let line = node.line();
        let negated = self.match_keyword("not");
        let name = self.expect_ident()?;
        let args = if self.match_token(&Token::LParen) {
            let (args, _) = self.parse_call_args()?;
            args
        } else if self.test_argument_follows() {
            vec![self.parse_primary()?]
        } else {
            Vec::new()
        };
        Ok(Expr::Test {
            node: Box::new(node),
            name,
            negated,
            args,
            line,
        })
    }

    /// `x is divisibleby 3` style bare test arguments: a literal or a name
    /// that is not a keyword continuing the expression.
    fn test_argument_follows(&self) -> bool {
        match self.peek() {
            Token::Int(_) | Token::Float(_) | Token::Str(_) => true,
            Token::Ident(name) => !matches!(
                name.as_str(),
                "and" | "or" | "not" | "if" | "else" | "in" | "is" | "recursive"
            ),
            _ => false,
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.advance() {
            Token::Int(value) => Ok(Expr::Const {
                value: Value::Number(Number::from(value)),
                line,
            }),
            Token::Float(value) => {
                let number = Number::from_f64(value)
                    .ok_or_else(|| ParseError::new(line, "non-finite number literal"))?;
                Ok(Expr::Const {
                    value: Value::Number(number),
                    line,
                })
            }
            Token::Str(text) => Ok(Expr::Const {
                value: Value::String(text),
                line,
            }),
            Token::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(Expr::Const {
                    value: Value::Bool(true),
                    line,
                }),
                "false" | "False" => Ok(Expr::Const {
                    value: Value::Bool(false),
                    line,
                }),
                "none" | "None" | "null" => Ok(Expr::Const {
                    value: Value::Null,
                    line,
                }),
                _ => Ok(Expr::Name { name, line }),
            },
            Token::LParen => {
                let first = self.parse_expression()?;
                if self.match_token(&Token::Comma) {
                    let mut items = vec![first];
                    while *self.peek() != Token::RParen {
                        items.push(self.parse_expression()?);
                        if !self.match_token(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::TupleLit { items, line })
                } else {
                    self.expect(Token::RParen)?;
                    Ok(first)
                }
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while *self.peek() != Token::RBracket {
                    if !items.is_empty() {
                        self.expect(Token::Comma)?;
                    }
                    items.push(self.parse_expression()?);
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::ListLit { items, line })
            }
            Token::LBrace => {
                let mut items = Vec::new();
                while *self.peek() != Token::RBrace {
                    if !items.is_empty() {
                        self.expect(Token::Comma)?;
                    }
                    let key = self.parse_expression()?;
                    self.expect(Token::Colon)?;
                    let value = self.parse_expression()?;
                    items.push((key, value));
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::DictLit { items, line })
            }
            other => Err(ParseError::new(
                line,
                format!("unexpected {other:?} in expression"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::jinja::ast::{BinaryOp, Expr, Stmt, Target};
    use serde_json::json;

    fn single_output(source: &str) -> Expr {
        let body = parse(source).expect("template should parse");
        let mut outputs = body.into_iter().filter_map(|stmt| match stmt {
            Stmt::Output { expr, .. } => Some(expr),
            _ => None,
        });
        let expr = outputs.next().expect("one output expected");
        assert!(outputs.next().is_none());
        expr
    }

    #[test]
    fn parses_plain_text_and_output() {
        let body = parse("hello {{ name }}!").unwrap();
        assert_eq!(body.len(), 3);
        assert!(matches!(&body[0], Stmt::Text { data, .. } if data == "hello "));
        assert!(
            matches!(&body[1], Stmt::Output { expr: Expr::Name { name, .. }, .. } if name == "name")
        );
    }

    #[test]
    fn attribute_chains_nest_outward() {
        let expr = single_output("{{ x.a.b }}");
        let Expr::Getattr { node, attr, .. } = expr else {
            panic!("expected attribute access");
        };
        assert_eq!(attr, "b");
        assert!(matches!(*node, Expr::Getattr { .. }));
    }

    #[test]
    fn filters_bind_tighter_than_operators() {
        let expr = single_output("{{ a|length + 1 }}");
        let Expr::BinOp {
            op: BinaryOp::Add,
            left,
            ..
        } = expr
        else {
            panic!("expected addition at the top");
        };
        assert!(matches!(*left, Expr::Filter { .. }));
    }

    #[test]
    fn filter_arguments_parse() {
        let expr = single_output("{{ xs|join(', ') }}");
        let Expr::Filter { name, args, .. } = expr else {
            panic!("expected filter");
        };
        assert_eq!(name, "join");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn tests_accept_bare_arguments() {
        let expr = single_output("{{ n is divisibleby 3 and m }}");
        let Expr::BinOp {
            op: BinaryOp::And,
            left,
            ..
        } = expr
        else {
            panic!("expected and");
        };
        let Expr::Test { name, args, .. } = *left else {
            panic!("expected test on the left");
        };
        assert_eq!(name, "divisibleby");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn conditional_expression_parses() {
        let expr = single_output("{{ a if c else b }}");
        assert!(matches!(
            expr,
            Expr::CondExpr {
                otherwise: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn literals_parse_to_json_values() {
        let expr = single_output("{{ {'a': [1, 2.5], 'b': (true, none)} }}");
        let Expr::DictLit { items, .. } = expr else {
            panic!("expected dict literal");
        };
        assert_eq!(items.len(), 2);
        let Expr::ListLit { items: list, .. } = &items[0].1 else {
            panic!("expected list literal");
        };
        assert_eq!(list[0], Expr::constant(json!(1), 1));
    }

    #[test]
    fn if_elif_else_folds_into_nested_ifs() {
        let body = parse("{% if a %}1{% elif b %}2{% else %}3{% endif %}").unwrap();
        let Stmt::If { else_body, .. } = &body[0] else {
            panic!("expected if");
        };
        assert_eq!(else_body.len(), 1);
        let Stmt::If {
            else_body: inner_else,
            ..
        } = &else_body[0]
        else {
            panic!("expected nested elif");
        };
        assert_eq!(inner_else.len(), 1);
    }

    #[test]
    fn for_loop_with_tuple_target_and_else() {
        let body = parse("{% for k, v in items %}{{ k }}{% else %}none{% endfor %}").unwrap();
        let Stmt::For {
            target, else_body, ..
        } = &body[0]
        else {
            panic!("expected for");
        };
        assert!(matches!(target, Target::Tuple { names, .. } if names == &["k", "v"]));
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn loop_filter_desugars_to_inner_if() {
        let body = parse("{% for x in xs if x.ok %}{{ x.name }}{% endfor %}").unwrap();
        let Stmt::For { body: inner, .. } = &body[0] else {
            panic!("expected for");
        };
        assert!(matches!(&inner[0], Stmt::If { .. }));
    }

    #[test]
    fn set_forms_parse() {
        let body = parse("{% set x = 1 %}{% set y %}text{% endset %}").unwrap();
        assert!(matches!(&body[0], Stmt::Set { .. }));
        assert!(matches!(&body[1], Stmt::SetBlock { filter: None, .. }));
    }

    #[test]
    fn macro_definition_parses() {
        let body = parse("{% macro input(name, type='text') %}{{ name }}{% endmacro %}").unwrap();
        let Stmt::Macro { name, params, .. } = &body[0] else {
            panic!("expected macro");
        };
        assert_eq!(name, "input");
        assert_eq!(params.len(), 2);
        assert!(params[1].default.is_some());
    }

    #[test]
    fn include_import_extends_parse() {
        let body = parse(
            "{% extends 'base.html' %}{% include 'head.html' ignore missing %}\
             {% import 'forms.html' as forms %}{% from 'forms.html' import input as field %}",
        )
        .unwrap();
        assert!(matches!(&body[0], Stmt::Extends { .. }));
        assert!(
            matches!(&body[1], Stmt::Include { ignore_missing, .. } if *ignore_missing)
        );
        assert!(matches!(&body[2], Stmt::Import { alias, .. } if alias == "forms"));
        assert!(matches!(&body[3], Stmt::FromImport { names, .. } if names.len() == 1));
    }

    #[test]
    fn comments_and_raw_blocks_are_data() {
        let body = parse("a{# note #}b{% raw %}{{ not_a_var }}{% endraw %}c").unwrap();
        let texts: Vec<&str> = body
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Text { data, .. } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["a", "b", "{{ not_a_var }}", "c"]);
    }

    #[test]
    fn whitespace_control_markers_are_accepted() {
        let body = parse("{%- if a -%}x{%- endif -%}").unwrap();
        assert!(matches!(&body[0], Stmt::If { .. }));
    }

    #[test]
    fn line_numbers_advance_with_newlines() {
        let body = parse("line one\n{{ a }}\n{{ b }}").unwrap();
        let lines: Vec<u32> = body
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Output { line, .. } => Some(*line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![2, 3]);
    }

    #[test]
    fn unterminated_tag_reports_error() {
        let err = parse("{{ a ").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn unknown_tag_reports_error() {
        assert!(parse("{% widget %}").is_err());
    }

    #[test]
    fn slices_parse_in_subscripts() {
        let expr = single_output("{{ xs[1:3] }}");
        let Expr::Getitem { index, .. } = expr else {
            panic!("expected subscript");
        };
        assert!(matches!(*index, Expr::Slice { .. }));
    }
}
