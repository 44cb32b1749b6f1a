//! Configuration reads over a short-lived command session.
//!
//! The device answers `GetCfg` (command id 14) with a flat-ish XML tree;
//! `SetCfg` is rejected by the firmware (error 16001 for every config
//! type) and is deliberately unsupported here. Replies are parsed with a
//! strict event reader; the `GB2312` declaration the firmware emits is
//! tolerated (bodies are plain ASCII in practice).

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::auth::{self, HashOracle};
use crate::constants::CONFIG_READ_TIMEOUT;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    frame_command, make_command_body, parse_body, read_message, ID_GET_CFG, ID_HEARTBEAT_REPLY,
};
use crate::session::{connect_stream, SessionConfig};

/// One entry of the config-type registry.
#[derive(Debug, Clone, Copy)]
pub struct ConfigType {
    /// `GetCfg MainCmd` value.
    pub main_cmd: u32,
    /// Human-readable name.
    pub name: &'static str,
    /// Display icon.
    pub icon: &'static str,
    /// One-line description.
    pub description: &'static str,
}

/// Every config type the firmware is known to answer.
pub const CONFIG_TYPES: &[ConfigType] = &[
    ConfigType { main_cmd: 101, name: "Network", icon: "🌐", description: "IP address, ports, DHCP, DDNS, PPPoE, WiFi" },
    ConfigType { main_cmd: 103, name: "Network Services", icon: "📡", description: "NMS, AMS, NTP, Email settings" },
    ConfigType { main_cmd: 105, name: "Display / OSD", icon: "🖥️", description: "On-screen display, channel names, fonts" },
    ConfigType { main_cmd: 107, name: "Encoding", icon: "🎬", description: "Compression, resolution, bitrate, framerate" },
    ConfigType { main_cmd: 109, name: "Record Schedule", icon: "⏺️", description: "Recording schedules per channel" },
    ConfigType { main_cmd: 111, name: "System Time", icon: "🕐", description: "Current DVR date and time" },
    ConfigType { main_cmd: 115, name: "Decoder / Serial", icon: "🔌", description: "Serial port and decoder (PTZ) settings" },
    ConfigType { main_cmd: 117, name: "Alarm", icon: "🚨", description: "Alarm inputs, outputs, motion detection" },
    ConfigType { main_cmd: 121, name: "Users", icon: "👤", description: "User accounts and permissions" },
    ConfigType { main_cmd: 123, name: "Device Info", icon: "ℹ️", description: "Model, firmware, channel count (read-only)" },
    ConfigType { main_cmd: 125, name: "Device Config", icon: "⚙️", description: "DVR ID, timezone, DST, language, device name" },
    ConfigType { main_cmd: 127, name: "Storage", icon: "💾", description: "Hard disk info, disk groups" },
    ConfigType { main_cmd: 129, name: "Device Status", icon: "📊", description: "Live channel status, motion, bitrates" },
    ConfigType { main_cmd: 131, name: "Maintenance", icon: "🔧", description: "Auto-maintenance schedule" },
    ConfigType { main_cmd: 133, name: "Custom Settings", icon: "🎛️", description: "Work mode, feature toggles (email, CMS, NTP)" },
    ConfigType { main_cmd: 139, name: "Source Device", icon: "📹", description: "Connected camera/source info" },
    ConfigType { main_cmd: 221, name: "Storage (Extended)", icon: "💿", description: "Extended disk and partition info" },
];

/// Registry lookup by `MainCmd`.
pub fn config_type(main_cmd: u32) -> Option<&'static ConfigType> {
    CONFIG_TYPES.iter().find(|t| t.main_cmd == main_cmd)
}

/// A parsed XML element: attributes, child elements grouped by tag, and
/// any text content.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct XmlNode {
    /// Attribute name → value.
    pub attrs: BTreeMap<String, String>,
    /// Child tag → occurrences in document order.
    pub children: BTreeMap<String, Vec<XmlNode>>,
    /// Trimmed text content, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl XmlNode {
    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// First child element with the given tag, searched depth-first.
    pub fn find(&self, tag: &str) -> Option<&XmlNode> {
        if let Some(node) = self.children.get(tag).and_then(|v| v.first()) {
            return Some(node);
        }
        for nodes in self.children.values() {
            for child in nodes {
                if let Some(found) = child.find(tag) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// A decoded `GetCfgReply`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigRecord {
    /// `ConfigLen` attribute (0 when absent).
    pub config_len: u32,
    /// Firmware config version string.
    pub version: String,
    /// Raw `CmdReply` code; `"0"` is success.
    pub cmd_reply: String,
    /// Echoed `MainCommand` from the `CfgInfo` element.
    pub main_cmd: Option<u32>,
    /// Echoed `AssistCommand` from the `CfgInfo` element.
    pub assist_cmd: Option<i32>,
    /// The config payload: tag → elements.
    pub data: BTreeMap<String, Vec<XmlNode>>,
    /// Set when `cmd_reply` signalled an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn node_from_start(e: &BytesStart<'_>) -> XmlNode {
    let mut node = XmlNode::default();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map(|v| v.to_string())
            .unwrap_or_default();
        node.attrs.insert(key, value);
    }
    node
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

/// Parse an XML document into a pseudo-root node whose children hold the
/// top-level elements.
fn parse_document(xml: &str) -> SessionResult<XmlNode> {
    let mut reader = Reader::from_str(xml);
    let mut doc = XmlNode::default();
    let mut stack: Vec<(String, XmlNode)> = Vec::new();

    fn attach(stack: &mut [(String, XmlNode)], doc: &mut XmlNode, tag: String, node: XmlNode) {
        let target = match stack.last_mut() {
            Some((_, parent)) => parent,
            None => doc,
        };
        target.children.entry(tag).or_default().push(node);
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = tag_name(&e);
                let node = node_from_start(&e);
                stack.push((tag, node));
            }
            Ok(Event::Empty(e)) => {
                let tag = tag_name(&e);
                let node = node_from_start(&e);
                attach(&mut stack, &mut doc, tag, node);
            }
            Ok(Event::Text(t)) => {
                if let Some((_, node)) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map(|c| c.trim().to_string())
                        .unwrap_or_default();
                    if !text.is_empty() {
                        node.text = Some(text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                let (tag, node) = stack
                    .pop()
                    .ok_or_else(|| SessionError::Protocol("unbalanced XML reply".into()))?;
                attach(&mut stack, &mut doc, tag, node);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {} // declaration, comments, PIs
            Err(e) => return Err(SessionError::Protocol(format!("XML parse error: {e}"))),
        }
    }
    if !stack.is_empty() {
        return Err(SessionError::Protocol("truncated XML reply".into()));
    }
    Ok(doc)
}

/// Parse a `GetCfgReply` body into a [`ConfigRecord`].
pub fn parse_config_xml(xml: &str) -> SessionResult<ConfigRecord> {
    let doc = parse_document(xml)?;
    let reply = doc
        .find("GetCfgReply")
        .ok_or_else(|| SessionError::Protocol("no GetCfgReply in response".into()))?;

    let mut record = ConfigRecord {
        config_len: reply.attr("ConfigLen").and_then(|v| v.parse().ok()).unwrap_or(0),
        version: reply.attr("Version").unwrap_or_default().to_string(),
        cmd_reply: reply.attr("CmdReply").unwrap_or_default().to_string(),
        main_cmd: None,
        assist_cmd: None,
        data: BTreeMap::new(),
        error: None,
    };

    if record.cmd_reply != "0" {
        record.error = Some(format!("device returned error {}", record.cmd_reply));
        return Ok(record);
    }

    for (tag, nodes) in &reply.children {
        if tag == "CfgInfo" {
            if let Some(info) = nodes.first() {
                record.main_cmd = info.attr("MainCommand").and_then(|v| v.parse().ok());
                record.assist_cmd = info.attr("AssistCommand").and_then(|v| v.parse().ok());
            }
        } else {
            record.data.insert(tag.clone(), nodes.clone());
        }
    }
    Ok(record)
}

/// A config record tagged with its registry entry, as returned by
/// [`ConfigClient::get_all_configs`].
#[derive(Debug, Clone, Serialize)]
pub struct NamedConfig {
    /// Registry display name.
    pub name: &'static str,
    /// Registry icon.
    pub icon: &'static str,
    /// Registry description.
    pub description: &'static str,
    /// The decoded record, when the read succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ConfigRecord>,
    /// The failure, when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads configuration from the DVR over its own command session.
///
/// Unlike [`crate::DvrSession`] this client is fully synchronous: no
/// background reader runs, and heartbeats that land between request and
/// reply are answered inline.
pub struct ConfigClient {
    config: SessionConfig,
    oracle: Arc<dyn HashOracle>,
    sock: Option<TcpStream>,
}

impl std::fmt::Debug for ConfigClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigClient")
            .field("host", &self.config.host)
            .field("connected", &self.sock.is_some())
            .finish_non_exhaustive()
    }
}

impl ConfigClient {
    /// New, unconnected client.
    pub fn new(config: SessionConfig, oracle: Arc<dyn HashOracle>) -> Self {
        Self { config, oracle, sock: None }
    }

    /// Establish the TCP connection and log in.
    pub fn connect(&mut self) -> SessionResult<()> {
        let mut sock = connect_stream(&self.config.host, self.config.cmd_port)?;
        sock.set_read_timeout(Some(CONFIG_READ_TIMEOUT))?;

        // The config session uses the bare-nonce login variant.
        let nonce = auth::fetch_login_flag(&mut sock, "<LoginGetFlag />")?;
        let hash = self.oracle.credential_hash(
            &nonce,
            &self.config.username,
            &self.config.password,
        )?;
        auth::submit_login(
            &mut sock,
            &format!(
                r#"<UserLogin LoginFlag="{hash}" UserName="{}" PassWord="{}" />"#,
                self.config.username, self.config.password
            ),
        )?;

        self.sock = Some(sock);
        Ok(())
    }

    /// Drop the connection.
    pub fn close(&mut self) {
        if let Some(sock) = self.sock.take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
    }

    /// Read one config type. `assist_cmd` is usually `-1` ("all").
    ///
    /// Heartbeats arriving in place of the reply are answered and skipped;
    /// after five consecutive non-config messages the call fails with a
    /// protocol error.
    pub fn get_config(&mut self, main_cmd: u32, assist_cmd: i32) -> SessionResult<ConfigRecord> {
        if self.sock.is_none() {
            self.connect()?;
        }
        let sock = self
            .sock
            .as_mut()
            .ok_or_else(|| SessionError::Protocol("config session not connected".into()))?;

        let body = make_command_body(
            ID_GET_CFG,
            &format!(r#"<GetCfg MainCmd="{main_cmd}" AssistCmd="{assist_cmd}" />"#),
        );
        sock.write_all(&frame_command(&body, None))?;

        for _ in 0..5 {
            let (_, raw) = read_message(sock, CONFIG_READ_TIMEOUT)?
                .ok_or_else(|| SessionError::closed("GetCfg"))?;
            let xml = parse_body(&raw);
            if xml.contains("HeartBeat") {
                let reply = make_command_body(ID_HEARTBEAT_REPLY, "<HeartBeatNoticeReply />");
                sock.write_all(&frame_command(&reply, None))?;
                continue;
            }
            return parse_config_xml(&xml);
        }
        Err(SessionError::Protocol(
            "too many non-config responses from device".into(),
        ))
    }

    /// Read every known config type, reconnecting after a failed entry so
    /// one bad read does not poison the rest.
    pub fn get_all_configs(&mut self) -> BTreeMap<u32, NamedConfig> {
        let mut results = BTreeMap::new();
        for ty in CONFIG_TYPES {
            let entry = match self.get_config(ty.main_cmd, -1) {
                Ok(record) => NamedConfig {
                    name: ty.name,
                    icon: ty.icon,
                    description: ty.description,
                    record: Some(record),
                    error: None,
                },
                Err(e) => {
                    log::warn!("config {} ({}) failed: {e}", ty.main_cmd, ty.name);
                    self.close();
                    if let Err(e) = self.connect() {
                        log::warn!("config session reconnect failed: {e}");
                    }
                    NamedConfig {
                        name: ty.name,
                        icon: ty.icon,
                        description: ty.description,
                        record: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.insert(ty.main_cmd, entry);
        }
        results
    }
}

impl Drop for ConfigClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"<?xml version="1.0" encoding="GB2312" standalone="yes" ?>
<Command ID="15">
    <GetCfgReply CmdReply="0" ConfigLen="512" Version="1.2">
        <CfgInfo MainCommand="111" AssistCommand="-1" />
        <SySTime Year="2024" Month="6" Day="1">
            <Zone Name="UTC+1" />
        </SySTime>
    </GetCfgReply>
</Command>
"#;

    #[test]
    fn test_parse_reply_with_gb2312_declaration() {
        let record = parse_config_xml(REPLY).unwrap();
        assert_eq!(record.cmd_reply, "0");
        assert_eq!(record.config_len, 512);
        assert_eq!(record.version, "1.2");
        assert_eq!(record.main_cmd, Some(111));
        assert_eq!(record.assist_cmd, Some(-1));
        assert!(record.error.is_none());

        let systime = &record.data["SySTime"][0];
        assert_eq!(systime.attr("Year"), Some("2024"));
        let zone = &systime.children["Zone"][0];
        assert_eq!(zone.attr("Name"), Some("UTC+1"));
    }

    #[test]
    fn test_parse_reply_repeated_tags_become_lists() {
        let xml = r#"<Command ID="15"><GetCfgReply CmdReply="0">
            <CfgInfo MainCommand="127" AssistCommand="-1" />
            <Disk No="0" Size="1000" /><Disk No="1" Size="2000" />
        </GetCfgReply></Command>"#;
        let record = parse_config_xml(xml).unwrap();
        let disks = &record.data["Disk"];
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].attr("No"), Some("0"));
        assert_eq!(disks[1].attr("Size"), Some("2000"));
    }

    #[test]
    fn test_parse_reply_error_code_carries_error() {
        let xml = r#"<Command ID="15"><GetCfgReply CmdReply="16001" /></Command>"#;
        let record = parse_config_xml(xml).unwrap();
        assert_eq!(record.cmd_reply, "16001");
        assert!(record.error.as_deref().unwrap().contains("16001"));
        assert!(record.data.is_empty());
    }

    #[test]
    fn test_parse_reply_without_getcfgreply_is_protocol_error() {
        let err = parse_config_xml("<Command ID=\"15\" />").unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_parse_malformed_xml_is_protocol_error() {
        let err = parse_config_xml("<Command><Unclosed>").unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_text_content_is_captured() {
        let xml = r#"<Command><GetCfgReply CmdReply="0">
            <CfgInfo MainCommand="123" AssistCommand="-1" />
            <Model>HE-8404</Model>
        </GetCfgReply></Command>"#;
        let record = parse_config_xml(xml).unwrap();
        assert_eq!(record.data["Model"][0].text.as_deref(), Some("HE-8404"));
    }

    #[test]
    fn test_registry_lookup() {
        let ty = config_type(111).unwrap();
        assert_eq!(ty.name, "System Time");
        assert!(config_type(999).is_none());
        assert_eq!(CONFIG_TYPES.len(), 17);
    }
}
