//! rTorrent XML-RPC
//!
//! Only two calls are needed, both with string arguments and a single
//! return value. Requests are written out directly; replies are parsed
//! into a small element tree and read from there.

use super::{ConsumerError, endpoint};
use pia_network::{Request, Transport};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

/// rTorrent XML-RPC client
pub struct RtorrentClient<T> {
    transport: T,
    url: String,
}

impl<T: Transport> RtorrentClient<T> {
    /// `base` is the server root; calls go to `<base>/RPC2`
    pub fn new(transport: T, base: &str) -> Self {
        Self {
            transport,
            url: endpoint(base, "/RPC2"),
        }
    }

    /// `network.port_range.set` to `port-port`
    pub async fn set_port_range(&self, port: u16) -> Result<(), ConsumerError> {
        let range = format!("{port}-{port}");
        self.call("network.port_range.set", &["", &range]).await?;
        Ok(())
    }

    /// First port of `network.port_range`
    pub async fn port_range_start(&self) -> Result<u16, ConsumerError> {
        let range = self.call("network.port_range", &[""]).await?;
        parse_range_start(&range)
    }

    async fn call(&self, method: &str, params: &[&str]) -> Result<String, ConsumerError> {
        let request = Request::post(&self.url, method_call(method, params).into_bytes())?
            .header("Content-Type", "text/xml");

        debug!("rTorrent {} -> {}", method, self.url);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(ConsumerError::Status(response.status.as_u16()));
        }

        let text = response
            .text()
            .map_err(|e| ConsumerError::Decode(e.to_string()))?;
        parse_response(&text)
    }
}

fn method_call(method: &str, params: &[&str]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\"?>\n<methodCall><methodName>{}</methodName><params>",
        escape(method)
    );
    for param in params {
        xml.push_str("<param><value><string>");
        xml.push_str(&escape(*param));
        xml.push_str("</string></value></param>");
    }
    xml.push_str("</params></methodCall>\n");
    xml
}

/// Parsed XML element: its name, its own text, and child elements
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn from_tag(tag: &BytesStart<'_>) -> Self {
        Self {
            name: String::from_utf8_lossy(tag.name().as_ref()).into_owned(),
            ..Self::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn path(&self, names: &[&str]) -> Option<&Element> {
        names.iter().try_fold(self, |element, name| element.child(name))
    }
}

fn parse_tree(xml: &str) -> Result<Element, ConsumerError> {
    let malformed = |e: quick_xml::Error| ConsumerError::Decode(format!("malformed XML: {e}"));
    let unbalanced = || ConsumerError::Decode("unbalanced XML".to_string());

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Element::default()];
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(tag) => stack.push(Element::from_tag(&tag)),
            Event::Empty(tag) => stack
                .last_mut()
                .ok_or_else(unbalanced)?
                .children
                .push(Element::from_tag(&tag)),
            Event::End(_) => {
                let done = stack.pop().ok_or_else(unbalanced)?;
                stack.last_mut().ok_or_else(unbalanced)?.children.push(done);
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(malformed)?;
                stack.last_mut().ok_or_else(unbalanced)?.text.push_str(&text);
            }
            Event::CData(data) => {
                let data = data.into_inner();
                stack
                    .last_mut()
                    .ok_or_else(unbalanced)?
                    .text
                    .push_str(&String::from_utf8_lossy(&data));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(document), true) => Ok(document),
        _ => Err(unbalanced()),
    }
}

/// Value of a `methodResponse`, or its fault string
fn parse_response(xml: &str) -> Result<String, ConsumerError> {
    let document = parse_tree(xml)?;
    let response = document
        .child("methodResponse")
        .ok_or_else(|| ConsumerError::Decode("not a methodResponse".to_string()))?;

    if let Some(fault) = response.child("fault") {
        let reason = fault
            .path(&["value", "struct"])
            .and_then(|members| {
                members.children.iter().find(|member| {
                    member.child("name").is_some_and(|name| name.text == "faultString")
                })
            })
            .and_then(|member| member.child("value"))
            .map(scalar)
            .unwrap_or_else(|| "unknown fault".to_string());
        return Err(ConsumerError::Rpc(reason));
    }

    response
        .path(&["params", "param", "value"])
        .map(scalar)
        .ok_or_else(|| ConsumerError::Decode("no value in methodResponse".to_string()))
}

/// Text of a `<value>`: the untyped form, or the content of its type tag
fn scalar(value: &Element) -> String {
    match value.children.first() {
        Some(typed) => typed.text.clone(),
        None => value.text.clone(),
    }
}

fn parse_range_start(range: &str) -> Result<u16, ConsumerError> {
    let first = range.split('-').next().unwrap_or_default().trim();
    first
        .parse()
        .map_err(|_| ConsumerError::Decode(format!("unexpected port range {range:?}")))
}
