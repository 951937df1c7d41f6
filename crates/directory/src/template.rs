//! Restricted template language for filters, usernames and LDIF scripts
//!
//! Operators write templates in the `{{.Field | helper arg}}` dialect used
//! throughout directory tooling. Each action is validated and rewritten into
//! a handlebars expression before rendering:
//!
//! | written                              | rendered by handlebars as           |
//! |--------------------------------------|-------------------------------------|
//! | `{{.Username}}`                      | `{{Username}}`                      |
//! | `{{random 10}}`                      | `{{random 10}}`                     |
//! | `{{.Password \| utf16le \| base64}}` | `{{base64 (utf16le Password)}}`     |
//! | `{{- .Name -}}`                      | `{{~Name~}}`                        |
//!
//! Only the helpers in [`HELPERS`] are callable. Block constructs, partials,
//! comments and variables are rejected, and rendering runs in strict mode so
//! that a reference to an unknown field fails instead of rendering empty.

use chrono::Utc;
use handlebars::{Handlebars, handlebars_helper};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{DirectoryError, Result};

/// Helper functions a template may call
pub const HELPERS: &[&str] = &[
    "random",
    "unix_time",
    "utf16le",
    "base64",
    "lowercase",
    "uppercase",
    "truncate",
    "printf",
];

const BLOCK_KEYWORDS: &[&str] = &[
    "if", "else", "end", "range", "with", "define", "template", "block", "break", "continue",
];

/// Generate `len` random characters from `[A-Za-z0-9]`
pub fn random_base62(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

handlebars_helper!(random_helper: |n: u64| random_base62(n as usize));
handlebars_helper!(unix_time_helper: |*_args| Utc::now().timestamp());
handlebars_helper!(utf16le_helper: |s: str| {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<u8>>()
});
handlebars_helper!(base64_helper: |v: Json| BASE64.encode(json_bytes(v)));
handlebars_helper!(lowercase_helper: |s: str| s.to_lowercase());
handlebars_helper!(uppercase_helper: |s: str| s.to_uppercase());
handlebars_helper!(truncate_helper: |n: u64, s: str| s.chars().take(n as usize).collect::<String>());
handlebars_helper!(printf_helper: |format: str, *args| go_printf(format, args.get(1..).unwrap_or_default()));

/// Bytes carried by a helper argument
///
/// `utf16le` yields an array of byte values so that it can be piped into
/// `base64`; every other value is encoded from its text form.
fn json_bytes(value: &serde_json::Value) -> Vec<u8> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(serde_json::Value::as_u64)
            .map(|b| b as u8)
            .collect(),
        serde_json::Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

/// Minimal `printf`: `%s`, `%v`, `%d`, `%q` and `%%`
fn go_printf(format: &str, args: &[&serde_json::Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'v' | 'd' | 'q')) => {
                let text = args.next().map(|a| plain_text(a)).unwrap_or_default();
                if verb == 'q' {
                    out.push('"');
                    for ch in text.chars() {
                        if matches!(ch, '"' | '\\') {
                            out.push('\\');
                        }
                        out.push(ch);
                    }
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn plain_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Payload for the user search filter
#[derive(Debug, Clone, Serialize)]
pub struct FilterContext {
    /// Attribute holding the username, already filter-escaped
    #[serde(rename = "UserAttr")]
    pub user_attr: String,
    /// Username, already filter-escaped
    #[serde(rename = "Username")]
    pub username: String,
}

impl FilterContext {
    /// Synthetic payload used to validate a template on config write
    pub fn probe() -> Self {
        Self {
            user_attr: "cn".to_string(),
            username: "probe".to_string(),
        }
    }
}

/// Payload for the group search filter
#[derive(Debug, Clone, Serialize)]
pub struct GroupFilterContext {
    /// DN of the user, already filter-escaped
    #[serde(rename = "UserDN")]
    pub user_dn: String,
    /// Username, already filter-escaped
    #[serde(rename = "Username")]
    pub username: String,
}

impl GroupFilterContext {
    /// Synthetic payload used to validate a template on config write
    pub fn probe() -> Self {
        Self {
            user_dn: "cn=probe,dc=example,dc=com".to_string(),
            username: "probe".to_string(),
        }
    }
}

/// Template renderer exposing only whitelisted helpers
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::restricted()
    }
}

impl TemplateEngine {
    /// Build a renderer with the whitelisted helpers registered
    pub fn restricted() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("random", Box::new(random_helper));
        registry.register_helper("unix_time", Box::new(unix_time_helper));
        registry.register_helper("utf16le", Box::new(utf16le_helper));
        registry.register_helper("base64", Box::new(base64_helper));
        registry.register_helper("lowercase", Box::new(lowercase_helper));
        registry.register_helper("uppercase", Box::new(uppercase_helper));
        registry.register_helper("truncate", Box::new(truncate_helper));
        registry.register_helper("printf", Box::new(printf_helper));
        Self { registry }
    }

    /// Validate and render `template` against `data`
    pub fn render<T: Serialize>(&self, template: &str, data: &T) -> Result<String> {
        let normalized = normalize(template)?;
        self.registry
            .render_template(&normalized, data)
            .map_err(|e| DirectoryError::Template(e.to_string()))
    }
}

/// Rewrite a template into handlebars syntax, rejecting anything outside the
/// restricted dialect
pub fn normalize(template: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = find_close(after_open).ok_or_else(|| {
            template_error(template, "unclosed action: missing '}}'")
        })?;
        out.push_str(&rewrite_action(&after_open[..close], template)?);
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Index of the `}}` closing the action, skipping quoted strings
fn find_close(action: &str) -> Option<usize> {
    let bytes = action.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == b'\\' && q == b'"' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'`' => quote = Some(b),
            None if b == b'}' && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn rewrite_action(body: &str, template: &str) -> Result<String> {
    let mut inner = body;
    let trim_left = inner.starts_with("- ") || inner.starts_with("-\t") || inner.starts_with("-\n");
    if trim_left {
        inner = &inner[1..];
    }
    let trim_right = inner.ends_with(" -") || inner.ends_with("\t-") || inner.ends_with("\n-");
    if trim_right {
        inner = &inner[..inner.len() - 1];
    }
    let inner = inner.trim();
    if inner.is_empty() {
        return Err(template_error(template, "empty action"));
    }
    if let Some(first) = inner.chars().next()
        && matches!(first, '#' | '/' | '>' | '!' | '^' | '{' | '&' | '~')
    {
        return Err(template_error(
            template,
            &format!("unsupported construct '{{{{{inner}}}}}'"),
        ));
    }

    let tokens = tokenize(inner, template)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        template,
    };
    let pipeline = parser.pipeline()?;
    if parser.pos != tokens.len() {
        return Err(template_error(template, "unbalanced ')'"));
    }

    let expr = pipeline.render(template)?;
    if let Expr::Literal(text) = &expr {
        return Ok(literal_text(text));
    }
    let ltrim = if trim_left { "~" } else { "" };
    let rtrim = if trim_right { "~" } else { "" };
    Ok(format!("{{{{{ltrim}{}{rtrim}}}}}", expr.text()))
}

fn literal_text(literal: &str) -> String {
    match literal.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => literal.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Ident(String),
    Literal(String),
    Pipe,
    Open,
    Close,
}

fn tokenize(body: &str, template: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(template_error(template, "unterminated string"));
                }
                i += 1;
                tokens.push(Token::Literal(chars[start..i].iter().collect()));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .map(|p| start + p)
                    .ok_or_else(|| template_error(template, "unterminated raw string"))?;
                let raw: String = chars[start..end].iter().collect();
                let escaped = raw.replace('\\', "\\\\").replace('"', "\\\"");
                tokens.push(Token::Literal(format!("\"{escaped}\"")));
                i = end + 1;
            }
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len()
                    && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '.')
                {
                    end += 1;
                }
                let path: String = chars[start..end].iter().collect();
                if path.starts_with('.') || path.ends_with('.') {
                    return Err(template_error(template, &format!("malformed field '.{path}'")));
                }
                tokens.push(Token::Field(path));
                i = end;
            }
            '$' => return Err(template_error(template, "variables are not supported")),
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Literal(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if BLOCK_KEYWORDS.contains(&word.as_str()) {
                    return Err(template_error(
                        template,
                        &format!("'{word}' blocks are not supported"),
                    ));
                }
                match word.as_str() {
                    "true" | "false" => tokens.push(Token::Literal(word)),
                    name if HELPERS.contains(&name) => tokens.push(Token::Ident(word)),
                    _ => {
                        return Err(template_error(
                            template,
                            &format!("function \"{word}\" not defined"),
                        ));
                    }
                }
            }
            other => {
                return Err(template_error(
                    template,
                    &format!("unexpected character '{other}'"),
                ));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Operand {
    Field(String),
    Literal(String),
    Func(String),
    Group(Pipeline),
}

#[derive(Debug)]
struct Pipeline {
    commands: Vec<Vec<Operand>>,
}

/// A rendered handlebars expression
enum Expr {
    Path(String),
    Literal(String),
    Call(String),
}

impl Expr {
    fn text(&self) -> &str {
        match self {
            Self::Path(s) | Self::Literal(s) | Self::Call(s) => s,
        }
    }

    /// Form usable as a helper argument
    fn as_arg(&self) -> String {
        match self {
            Self::Call(s) => format!("({s})"),
            Self::Path(s) | Self::Literal(s) => s.clone(),
        }
    }
}

impl Pipeline {
    fn render(&self, template: &str) -> Result<Expr> {
        let mut acc: Option<Expr> = None;
        for (index, command) in self.commands.iter().enumerate() {
            let Some((head, args)) = command.split_first() else {
                return Err(template_error(template, "missing command in pipeline"));
            };
            let expr = match head {
                Operand::Func(name) => {
                    let mut parts = vec![name.clone()];
                    for arg in args {
                        parts.push(arg.render(template)?.as_arg());
                    }
                    if let Some(piped) = acc.take() {
                        parts.push(piped.as_arg());
                    }
                    Expr::Call(parts.join(" "))
                }
                operand => {
                    if index > 0 {
                        return Err(template_error(template, "can only pipe into a function"));
                    }
                    if !args.is_empty() {
                        return Err(template_error(template, "a value cannot take arguments"));
                    }
                    operand.render(template)?
                }
            };
            acc = Some(expr);
        }
        acc.ok_or_else(|| template_error(template, "empty pipeline"))
    }
}

impl Operand {
    fn render(&self, template: &str) -> Result<Expr> {
        Ok(match self {
            Self::Field(path) if path.is_empty() => Expr::Path("this".to_string()),
            Self::Field(path) => Expr::Path(path.clone()),
            Self::Literal(text) => Expr::Literal(text.clone()),
            Self::Func(name) => Expr::Call(name.clone()),
            Self::Group(pipeline) => pipeline.render(template)?,
        })
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    template: &'a str,
}

impl Parser<'_> {
    fn pipeline(&mut self) -> Result<Pipeline> {
        let mut commands = vec![Vec::new()];
        while let Some(token) = self.tokens.get(self.pos) {
            match token {
                Token::Close => break,
                Token::Pipe => {
                    self.pos += 1;
                    commands.push(Vec::new());
                }
                Token::Open => {
                    self.pos += 1;
                    let inner = self.pipeline()?;
                    if self.tokens.get(self.pos) != Some(&Token::Close) {
                        return Err(template_error(self.template, "unclosed '('"));
                    }
                    self.pos += 1;
                    push_operand(&mut commands, Operand::Group(inner));
                }
                Token::Field(path) => {
                    self.pos += 1;
                    push_operand(&mut commands, Operand::Field(path.clone()));
                }
                Token::Literal(text) => {
                    self.pos += 1;
                    push_operand(&mut commands, Operand::Literal(text.clone()));
                }
                Token::Ident(name) => {
                    self.pos += 1;
                    push_operand(&mut commands, Operand::Func(name.clone()));
                }
            }
        }
        if commands.iter().any(Vec::is_empty) {
            return Err(template_error(self.template, "missing command in pipeline"));
        }
        Ok(Pipeline { commands })
    }
}

fn push_operand(commands: &mut [Vec<Operand>], operand: Operand) {
    if let Some(last) = commands.last_mut() {
        last.push(operand);
    }
}

fn template_error(template: &str, reason: &str) -> DirectoryError {
    DirectoryError::Template(format!("{reason} in template '{template}'"))
}
