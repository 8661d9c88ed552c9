//! Minimal XML-RPC client: request encoding, response decoding and an HTTP
//! transport built on `reqwest`.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::CollectionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Boolean(bool),
    String(String),
    Double(f64),
    DateTime(String),
    Base64(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Nil,
}

impl Value {
    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Serializes a parameterless `methodCall` document.
pub fn encode_call(method: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?><methodCall><methodName>{}</methodName><params></params></methodCall>",
        quick_xml::escape::escape(method)
    )
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(String),
    Close(String),
    Empty(String),
    Text(String),
}

fn tokenize(body: &str) -> Result<Vec<Token>, CollectionError> {
    let mut reader = Reader::from_str(body);
    let mut tokens = Vec::new();

    loop {
        let event = reader.read_event().map_err(malformed)?;
        let token = match event {
            Event::Start(e) => Token::Open(tag_name(e.name().as_ref())),
            Event::End(e) => Token::Close(tag_name(e.name().as_ref())),
            Event::Empty(e) => Token::Empty(tag_name(e.name().as_ref())),
            Event::Text(t) => Token::Text(t.unescape().map_err(malformed)?.into_owned()),
            Event::CData(c) => Token::Text(String::from_utf8_lossy(&c.into_inner()).into_owned()),
            Event::Eof => break,
            _ => continue,
        };

        // text split around CDATA sections is one value
        if let (Token::Text(next), Some(Token::Text(prev))) = (&token, tokens.last_mut()) {
            prev.push_str(next);
            continue;
        }
        tokens.push(token);
    }

    Ok(tokens)
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn malformed(e: quick_xml::Error) -> CollectionError {
    CollectionError::Protocol(format!("malformed XML: {e}"))
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, CollectionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| CollectionError::Protocol("unexpected end of document".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn skip_ws(&mut self) {
        while let Some(Token::Text(t)) = self.peek() {
            if !t.trim().is_empty() {
                break;
            }
            self.pos += 1;
        }
    }

    fn expect_open(&mut self, name: &str) -> Result<(), CollectionError> {
        self.skip_ws();
        match self.next()? {
            Token::Open(n) if n == name => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    fn expect_close(&mut self, name: &str) -> Result<(), CollectionError> {
        self.skip_ws();
        match self.next()? {
            Token::Close(n) if n == name => Ok(()),
            other => Err(unexpected(&format!("/{name}"), &other)),
        }
    }

    fn at_close(&mut self, name: &str) -> bool {
        self.skip_ws();
        matches!(self.peek(), Some(Token::Close(n)) if n == name)
    }

    /// Text content up to and including the closing tag `name`.
    fn read_text(&mut self, name: &str) -> Result<String, CollectionError> {
        let text = match self.peek() {
            Some(Token::Text(t)) => {
                let t = t.clone();
                self.pos += 1;
                t
            }
            _ => String::new(),
        };
        match self.next()? {
            Token::Close(n) if n == name => Ok(text),
            other => Err(unexpected(&format!("/{name}"), &other)),
        }
    }

    fn parse_value(&mut self) -> Result<Value, CollectionError> {
        self.skip_ws();
        match self.next()? {
            Token::Empty(n) if n == "value" => return Ok(Value::String(String::new())),
            Token::Open(n) if n == "value" => {}
            other => return Err(unexpected("value", &other)),
        }

        // untyped content is a string and keeps its whitespace
        if let Some(Token::Text(t)) = self.peek() {
            if matches!(self.tokens.get(self.pos + 1), Some(Token::Close(n)) if n == "value") {
                let text = t.clone();
                self.pos += 2;
                return Ok(Value::String(text));
            }
        }
        if matches!(self.peek(), Some(Token::Close(n)) if n == "value") {
            self.pos += 1;
            return Ok(Value::String(String::new()));
        }

        self.skip_ws();
        let value = match self.next()? {
            Token::Empty(kind) => empty_value(&kind)?,
            Token::Open(kind) => self.parse_typed(&kind)?,
            other => return Err(unexpected("value type", &other)),
        };
        self.expect_close("value")?;
        Ok(value)
    }

    fn parse_typed(&mut self, kind: &str) -> Result<Value, CollectionError> {
        let value = match kind {
            "i4" | "int" | "i8" => {
                let text = self.read_text(kind)?;
                let v = text
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| CollectionError::Protocol(format!("invalid integer {text:?}")))?;
                Value::Int(v)
            }
            "boolean" => match self.read_text(kind)?.trim() {
                "1" => Value::Boolean(true),
                "0" => Value::Boolean(false),
                other => {
                    return Err(CollectionError::Protocol(format!("invalid boolean {other:?}")));
                }
            },
            "double" => {
                let text = self.read_text(kind)?;
                let v = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| CollectionError::Protocol(format!("invalid double {text:?}")))?;
                Value::Double(v)
            }
            "string" => Value::String(self.read_text(kind)?),
            "dateTime.iso8601" => Value::DateTime(self.read_text(kind)?.trim().to_string()),
            "base64" => Value::Base64(self.read_text(kind)?.trim().to_string()),
            "nil" => {
                self.expect_close(kind)?;
                Value::Nil
            }
            "array" => {
                let mut items = Vec::new();
                self.skip_ws();
                match self.next()? {
                    Token::Empty(n) if n == "data" => {}
                    Token::Open(n) if n == "data" => {
                        while !self.at_close("data") {
                            items.push(self.parse_value()?);
                        }
                        self.expect_close("data")?;
                    }
                    other => return Err(unexpected("data", &other)),
                }
                self.expect_close(kind)?;
                Value::Array(items)
            }
            "struct" => {
                let mut members = BTreeMap::new();
                while !self.at_close("struct") {
                    self.expect_open("member")?;
                    self.expect_open("name")?;
                    let name = self.read_text("name")?;
                    let value = self.parse_value()?;
                    self.expect_close("member")?;
                    members.insert(name, value);
                }
                self.expect_close(kind)?;
                Value::Struct(members)
            }
            other => {
                return Err(CollectionError::Protocol(format!("unsupported value type <{other}>")));
            }
        };
        Ok(value)
    }
}

fn empty_value(kind: &str) -> Result<Value, CollectionError> {
    match kind {
        "string" => Ok(Value::String(String::new())),
        "base64" => Ok(Value::Base64(String::new())),
        "nil" => Ok(Value::Nil),
        "array" => Ok(Value::Array(Vec::new())),
        "struct" => Ok(Value::Struct(BTreeMap::new())),
        other => Err(CollectionError::Protocol(format!("empty <{other}/> has no value"))),
    }
}

fn unexpected(expected: &str, found: &Token) -> CollectionError {
    CollectionError::Protocol(format!("expected <{expected}>, found {found:?}"))
}

/// Decodes a `methodResponse` document. A fault response becomes
/// [`CollectionError::Fault`].
pub fn parse_response(body: &str) -> Result<Value, CollectionError> {
    let mut cursor = Cursor {
        tokens: tokenize(body)?,
        pos: 0,
    };

    cursor.expect_open("methodResponse")?;
    cursor.skip_ws();
    let value = match cursor.next()? {
        Token::Open(n) if n == "params" => {
            cursor.expect_open("param")?;
            let value = cursor.parse_value()?;
            cursor.expect_close("param")?;
            cursor.expect_close("params")?;
            value
        }
        Token::Open(n) if n == "fault" => {
            let fault = cursor.parse_value()?;
            return Err(fault_error(&fault));
        }
        other => return Err(unexpected("params", &other)),
    };
    cursor.expect_close("methodResponse")?;

    Ok(value)
}

fn fault_error(fault: &Value) -> CollectionError {
    let members = fault.as_struct();
    let code = members
        .and_then(|m| m.get("faultCode"))
        .and_then(Value::as_i64)
        .unwrap_or_default();
    let message = members
        .and_then(|m| m.get("faultString"))
        .and_then(Value::as_str)
        .unwrap_or("unknown fault")
        .to_string();
    CollectionError::Fault { code, message }
}

/// XML-RPC over HTTP POST.
pub struct XmlRpcClient {
    endpoint: String,
    http: reqwest::Client,
    credentials: Option<(String, Option<String>)>,
}

impl XmlRpcClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CollectionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| CollectionError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            http,
            credentials: None,
        })
    }

    pub fn with_basic_auth(mut self, username: String, password: Option<String>) -> Self {
        self.credentials = Some((username, password));
        self
    }

    pub async fn call(&self, method: &str) -> Result<Value, CollectionError> {
        let mut request = self
            .http
            .post(self.endpoint.as_str())
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(encode_call(method));
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, password.as_ref());
        }

        let response = request.send().await.map_err(|e| self.transport(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollectionError::Protocol(format!(
                "{method} returned HTTP status {status}"
            )));
        }

        let body = response.text().await.map_err(|e| self.transport(e))?;
        parse_response(&body)
    }

    fn transport(&self, source: reqwest::Error) -> CollectionError {
        CollectionError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        }
    }
}
