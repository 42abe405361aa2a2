//! Command-line parser: words, quotes, and the operators `|`, `&&`, `||`,
//! `>`, `>>`, and a trailing `&`. One source line yields at most one
//! [`CommandLine`]; blank and comment-only lines yield `None`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("operator `{0}` has no command on its left")]
    DanglingOperator(&'static str),

    #[error("command line ends with an operator")]
    TrailingOperator,

    #[error("redirection without a target file")]
    MissingRedirectTarget,

    #[error("unexpected word after redirection target")]
    WordAfterRedirect,

    #[error("`&` is only allowed at the end of the line")]
    BackgroundNotLast,
}

/// One executable plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub exe: String,
    pub args: Vec<String>,
}

/// Where the final command's stdout goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutMode {
    #[default]
    Stdout,
    /// `>`: create or truncate.
    FileNew,
    /// `>>`: create or append.
    FileAppend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Command(Cmd),
    Pipe,
    And,
    Or,
}

/// A parsed line: the expression stream plus line-level redirection and
/// backgrounding, which apply to the final command only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    pub exprs: Vec<Expr>,
    pub out_mode: OutMode,
    pub out_file: Option<String>,
    pub background: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    And,
    Or,
    RedirNew,
    RedirAppend,
    Background,
}

fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => break,
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Or);
                } else {
                    tokens.push(Token::Pipe);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::And);
                } else {
                    tokens.push(Token::Background);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::RedirAppend);
                } else {
                    tokens.push(Token::RedirNew);
                }
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    match c {
                        c if c.is_whitespace() => break,
                        '|' | '&' | '>' | '#' => break,
                        '\'' => {
                            chars.next();
                            loop {
                                match chars.next() {
                                    Some('\'') => break,
                                    Some(c) => word.push(c),
                                    None => return Err(ParseError::UnterminatedQuote),
                                }
                            }
                        }
                        '"' => {
                            chars.next();
                            loop {
                                match chars.next() {
                                    Some('"') => break,
                                    Some('\\') => match chars.next() {
                                        Some(e @ ('"' | '\\')) => word.push(e),
                                        Some(other) => {
                                            word.push('\\');
                                            word.push(other);
                                        }
                                        None => return Err(ParseError::UnterminatedQuote),
                                    },
                                    Some(c) => word.push(c),
                                    None => return Err(ParseError::UnterminatedQuote),
                                }
                            }
                        }
                        '\\' => {
                            chars.next();
                            match chars.next() {
                                Some(e) => word.push(e),
                                None => break,
                            }
                        }
                        _ => {
                            word.push(c);
                            chars.next();
                        }
                    }
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Parse one line. `Ok(None)` for blank or comment-only input.
pub fn parse_line(line: &str) -> Result<Option<CommandLine>, ParseError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut out = CommandLine::default();
    let mut current: Option<Cmd> = None;
    let mut tokens = tokens.into_iter();

    while let Some(token) = tokens.next() {
        if out.background {
            return Err(ParseError::BackgroundNotLast);
        }
        match token {
            Token::Word(word) => {
                if out.out_file.is_some() {
                    return Err(ParseError::WordAfterRedirect);
                }
                match &mut current {
                    Some(cmd) => cmd.args.push(word),
                    None => {
                        current = Some(Cmd {
                            exe: word,
                            args: Vec::new(),
                        })
                    }
                }
            }
            Token::Pipe | Token::And | Token::Or => {
                let name = match token {
                    Token::Pipe => "|",
                    Token::And => "&&",
                    _ => "||",
                };
                let cmd = current
                    .take()
                    .ok_or(ParseError::DanglingOperator(name))?;
                out.exprs.push(Expr::Command(cmd));
                out.exprs.push(match token {
                    Token::Pipe => Expr::Pipe,
                    Token::And => Expr::And,
                    _ => Expr::Or,
                });
            }
            Token::RedirNew | Token::RedirAppend => {
                let (name, mode) = match token {
                    Token::RedirNew => (">", OutMode::FileNew),
                    _ => (">>", OutMode::FileAppend),
                };
                if current.is_none() {
                    return Err(ParseError::DanglingOperator(name));
                }
                out.out_mode = mode;
                match tokens.next() {
                    Some(Token::Word(target)) => out.out_file = Some(target),
                    _ => return Err(ParseError::MissingRedirectTarget),
                }
            }
            Token::Background => out.background = true,
        }
    }

    match current.take() {
        Some(cmd) => out.exprs.push(Expr::Command(cmd)),
        None => return Err(ParseError::TrailingOperator),
    }
    Ok(Some(out))
}
