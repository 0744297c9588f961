//! XML-RPC wire codec for the plugin surface and the local API client.
//!
//! Only the small slice of XML-RPC the plugin protocol exchanges is
//! modelled: strings, integers, booleans, structs and arrays. Inbound
//! plugin calls carry a session reference followed by a struct of
//! string arguments; responses carry a single value or a fault.

use std::collections::HashMap;
use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::faults::Fault;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("malformed document: {source}")]
    Xml { source: quick_xml::Error },
    #[error("malformed document: {reason}")]
    Malformed { reason: String },
    #[error("call carries no {what}")]
    MissingParam { what: &'static str },
    #[error("the remote side faulted: {code} {message}")]
    RemoteFault { code: i32, message: String },
}

fn malformed(reason: impl Into<String>) -> RpcError {
    RpcError::Malformed {
        reason: reason.into(),
    }
}

/// The slice of XML-RPC values this surface exchanges.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Struct(HashMap<String, Value>),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }
}

/// One inbound plugin call: method name, session reference, string
/// arguments.
#[derive(Debug, PartialEq)]
pub struct PluginCall {
    pub method: String,
    pub session: String,
    pub args: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

fn parse_tree(xml: &str) -> Result<Node, RpcError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut stack = vec![Node::default()];
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                stack.push(Node {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    ..Node::default()
                });
            }
            Ok(Event::Empty(start)) => {
                let node = Node {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    ..Node::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Text(text)) => {
                let piece = text
                    .unescape()
                    .map_err(|source| RpcError::Xml {
                        source: source.into(),
                    })?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&piece);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                let node = match stack.pop() {
                    Some(node) => node,
                    None => return Err(malformed("unbalanced document")),
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Err(malformed("unbalanced document")),
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(source) => return Err(RpcError::Xml { source }),
        }
    }
    let mut root = match stack.pop() {
        Some(root) if stack.is_empty() => root,
        _ => return Err(malformed("unbalanced document")),
    };
    match root.children.pop() {
        Some(doc) if root.children.is_empty() => Ok(doc),
        _ => Err(malformed("expected one document element")),
    }
}

fn child<'a>(node: &'a Node, name: &str) -> Result<&'a Node, RpcError> {
    node.children
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| malformed(format!("{} carries no {}", node.name, name)))
}

fn value_from_node(node: &Node) -> Result<Value, RpcError> {
    if node.name != "value" {
        return Err(malformed("expected a value element"));
    }
    let typed = match node.children.len() {
        // A bare value is a string per the XML-RPC grammar.
        0 => return Ok(Value::Str(node.text.clone())),
        1 => &node.children[0],
        _ => return Err(malformed("value carries more than one type element")),
    };
    match typed.name.as_str() {
        "string" => Ok(Value::Str(typed.text.clone())),
        "int" | "i4" => typed
            .text
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| malformed(format!("bad integer {}", typed.text))),
        "boolean" => match typed.text.trim() {
            "1" => Ok(Value::Bool(true)),
            "0" => Ok(Value::Bool(false)),
            other => Err(malformed(format!("bad boolean {other}"))),
        },
        // Doubles only show up in configuration values; carried as text.
        "double" => Ok(Value::Str(typed.text.clone())),
        "struct" => {
            let mut members = HashMap::new();
            for member in &typed.children {
                if member.name != "member" {
                    return Err(malformed("struct carries a non-member"));
                }
                let name = child(member, "name")?.text.clone();
                let value = value_from_node(child(member, "value")?)?;
                members.insert(name, value);
            }
            Ok(Value::Struct(members))
        }
        "array" => {
            let data = child(typed, "data")?;
            let items = data
                .children
                .iter()
                .map(value_from_node)
                .collect::<Result<_, _>>()?;
            Ok(Value::Array(items))
        }
        other => Err(malformed(format!("unsupported value type {other}"))),
    }
}

fn params_of(doc: &Node) -> Result<Vec<Value>, RpcError> {
    let mut values = Vec::new();
    if let Ok(params) = child(doc, "params") {
        for param in &params.children {
            if param.name != "param" {
                return Err(malformed("params carries a non-param"));
            }
            values.push(value_from_node(child(param, "value")?)?);
        }
    }
    Ok(values)
}

/// Parse one inbound plugin call: methodCall with a session reference
/// parameter followed by a struct of string arguments.
pub fn parse_plugin_call(xml: &str) -> Result<PluginCall, RpcError> {
    let doc = parse_tree(xml)?;
    if doc.name != "methodCall" {
        return Err(malformed("expected a methodCall"));
    }
    let method = child(&doc, "methodName")?.text.trim().to_string();
    let values = params_of(&doc)?;
    if values.len() != 2 {
        return Err(malformed("expected session and argument parameters"));
    }
    let mut values = values.into_iter();
    let session = match values.next() {
        Some(Value::Str(session)) => session,
        _ => return Err(RpcError::MissingParam { what: "session" }),
    };
    let args = match values.next() {
        Some(Value::Struct(members)) => members
            .into_iter()
            .map(|(name, value)| match value {
                Value::Str(s) => Ok((name, s)),
                _ => Err(malformed(format!("argument {name} is not a string"))),
            })
            .collect::<Result<HashMap<_, _>, _>>()?,
        _ => {
            return Err(RpcError::MissingParam {
                what: "argument struct",
            })
        }
    };
    Ok(PluginCall {
        method,
        session,
        args,
    })
}

/// Successful plugin response carrying a single string.
pub fn success_response(value: &str) -> String {
    format!(
        "<?xml version='1.0'?>\n<methodResponse>\n<params>\n<param>\n<value><string>{}</string></value>\n</param>\n</params>\n</methodResponse>\n",
        escape(value)
    )
}

/// Fault envelope: the catalog code and message, nothing else.
pub fn fault_response(fault: &Fault) -> String {
    format!(
        "<?xml version='1.0'?>\n<methodResponse>\n<fault>\n<value><struct>\n<member>\n<name>faultCode</name>\n<value><int>{}</int></value>\n</member>\n<member>\n<name>faultString</name>\n<value><string>{}</string></value>\n</member>\n</struct></value>\n</fault>\n</methodResponse>\n",
        fault.code,
        escape(fault.message.as_str())
    )
}

/// Serialise an outbound method call.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version='1.0'?>\n<methodCall>\n");
    let _ = write!(out, "<methodName>{}</methodName>\n<params>\n", escape(method));
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>\n");
    }
    out.push_str("</params>\n</methodCall>\n");
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Str(s) => {
            let _ = write!(out, "<value><string>{}</string></value>", escape(s.as_str()));
        }
        Value::Int(i) => {
            let _ = write!(out, "<value><int>{i}</int></value>");
        }
        Value::Bool(b) => {
            let _ = write!(out, "<value><boolean>{}</boolean></value>", u8::from(*b));
        }
        Value::Struct(members) => {
            out.push_str("<value><struct>");
            for (name, member) in members {
                let _ = write!(out, "<member><name>{}</name>", escape(name.as_str()));
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct></value>");
        }
        Value::Array(items) => {
            out.push_str("<value><array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array></value>");
        }
    }
}

/// Unwrap a methodResponse into its single value; wire faults surface
/// as [`RpcError::RemoteFault`].
pub fn parse_response(xml: &str) -> Result<Value, RpcError> {
    let doc = parse_tree(xml)?;
    if doc.name != "methodResponse" {
        return Err(malformed("expected a methodResponse"));
    }
    if let Ok(fault) = child(&doc, "fault") {
        let value = value_from_node(child(fault, "value")?)?;
        let members = match &value {
            Value::Struct(members) => members.clone(),
            _ => return Err(malformed("fault is not a struct")),
        };
        let code = match members.get("faultCode") {
            Some(Value::Int(code)) => *code as i32,
            _ => 0,
        };
        let message = match members.get("faultString") {
            Some(Value::Str(message)) => message.clone(),
            _ => String::new(),
        };
        return Err(RpcError::RemoteFault { code, message });
    }
    let mut values = params_of(&doc)?;
    match values.pop() {
        Some(value) if values.is_empty() => Ok(value),
        _ => Err(malformed("expected a single response parameter")),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    const CALL: &str = r#"<?xml version='1.0'?>
<methodCall>
<methodName>unpause</methodName>
<params>
<param><value><string>OpaqueRef:f1b2</string></value></param>
<param><value><struct>
<member><name>sr_uuid</name><value><string>sr-1</string></value></member>
<member><name>vdi_uuid</name><value><string>vdi-1</string></value></member>
<member><name>activate_parents</name><value><string>true</string></value></member>
</struct></value></param>
</params>
</methodCall>
"#;

    #[test]
    fn plugin_calls_parse() -> Result<()> {
        let call = parse_plugin_call(CALL)?;
        assert_eq!(call.method, "unpause");
        assert_eq!(call.session, "OpaqueRef:f1b2");
        assert_eq!(call.args.get("sr_uuid").map(String::as_str), Some("sr-1"));
        assert_eq!(call.args.get("vdi_uuid").map(String::as_str), Some("vdi-1"));
        assert_eq!(
            call.args.get("activate_parents").map(String::as_str),
            Some("true")
        );
        Ok(())
    }

    #[test]
    fn bare_values_read_as_strings() -> Result<()> {
        let call = CALL.replace("<string>sr-1</string>", "sr-1");
        let call = parse_plugin_call(&call)?;
        assert_eq!(call.args.get("sr_uuid").map(String::as_str), Some("sr-1"));
        Ok(())
    }

    #[test]
    fn a_call_without_arguments_is_rejected() {
        let call = "<methodCall><methodName>pause</methodName><params>\
                    <param><value><string>OpaqueRef:f1b2</string></value></param>\
                    </params></methodCall>";
        assert!(matches!(
            parse_plugin_call(call).unwrap_err(),
            RpcError::Malformed { .. }
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_plugin_call("not xml at all").is_err());
    }

    #[test]
    fn success_envelope_round_trips() -> Result<()> {
        let response = success_response("True");
        assert!(response.contains("<string>True</string>"));
        assert_eq!(parse_response(&response)?, Value::Str("True".to_string()));
        Ok(())
    }

    #[test]
    fn fault_envelope_escapes_and_round_trips() {
        let fault = Fault {
            code: 46,
            message: "no <such> &thing".to_string(),
        };
        let response = fault_response(&fault);
        assert!(response.contains("<int>46</int>"));
        assert!(response.contains("no &lt;such&gt; &amp;thing"));
        match parse_response(&response).unwrap_err() {
            RpcError::RemoteFault { code, message } => {
                assert_eq!(code, 46);
                assert_eq!(message, "no <such> &thing");
            }
            other => panic!("expected a remote fault, got {other:?}"),
        }
    }

    #[test]
    fn encoded_calls_carry_their_parameters() {
        let encoded = encode_call(
            "VDI.get_by_uuid",
            &[
                Value::Str("OpaqueRef:f1b2".to_string()),
                Value::Str("vdi-1".to_string()),
            ],
        );
        assert!(encoded.contains("<methodName>VDI.get_by_uuid</methodName>"));
        assert!(encoded.contains("<value><string>OpaqueRef:f1b2</string></value>"));
        assert!(encoded.contains("<value><string>vdi-1</string></value>"));
    }

    #[test]
    fn api_envelopes_parse_to_structs() -> Result<()> {
        let response = "<methodResponse><params><param><value><struct>\
                        <member><name>Status</name><value><string>Success</string></value></member>\
                        <member><name>Value</name><value><struct>\
                        <member><name>rate-limit</name><value><string>1048576</string></value></member>\
                        </struct></value></member>\
                        </struct></value></param></params></methodResponse>";
        let value = parse_response(response)?;
        let envelope = value.as_struct().expect("envelope should be a struct");
        assert_eq!(
            envelope.get("Status").and_then(Value::as_str),
            Some("Success")
        );
        let config = envelope
            .get("Value")
            .and_then(Value::as_struct)
            .expect("value should be a struct");
        assert_eq!(
            config.get("rate-limit").and_then(Value::as_str),
            Some("1048576")
        );
        Ok(())
    }

    #[test]
    fn booleans_and_arrays_parse() -> Result<()> {
        let response = "<methodResponse><params><param><value><struct>\
                        <member><name>Status</name><value><string>Success</string></value></member>\
                        <member><name>Value</name><value><boolean>1</boolean></value></member>\
                        <member><name>ErrorDescription</name><value><array><data>\
                        <value><string>HANDLE_INVALID</string></value>\
                        <value><string>VDI</string></value>\
                        </data></array></value></member>\
                        </struct></value></param></params></methodResponse>";
        let value = parse_response(response)?;
        let envelope = value.as_struct().expect("envelope should be a struct");
        assert_eq!(envelope.get("Value").and_then(Value::as_bool), Some(true));
        match envelope.get("ErrorDescription") {
            Some(Value::Array(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected an array, got {other:?}"),
        }
        Ok(())
    }
}
