//! `scan Ports`: open port discovery with nmap.
//!
//! Every IP is scanned separately with XML output on stdout. Hosts that cannot
//! be scanned end up in `Port-Errors` instead of failing the step.

use crate::contract::{InputSpec, ModuleResults, ModuleSpec, OutputSpec};
use crate::finding::Record;
use crate::module::{
    take_optional_string, take_string_list, Module, ModuleError, ModuleInputs, StepContext,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::process::Command;

const DEFAULT_ARGUMENTS: [&str; 3] = ["-T4", "-n", "-Pn"];
const NAMED_PORTS: [(&str, u16); 3] = [("SSH", 22), ("HTTP", 80), ("HTTPS", 443)];

pub fn spec() -> ModuleSpec {
    ModuleSpec::new(
        "scan",
        "Ports",
        "Scans the given IPs for open TCP/UDP ports using nmap.",
    )
    .input(InputSpec::records("ips", &["ip"], "IP addresses to scan").unwrapped())
    .input(
        InputSpec::scalar("protocols", "list of protocols to scan (tcp, udp)")
            .with_default(json!(["tcp"])),
    )
    .input(
        InputSpec::scalar("ports", "nmap port specification, e.g. '22,80,1000-2000'")
            .with_default(Value::Null),
    )
    .input(
        InputSpec::scalar("arguments", "additional nmap arguments").with_default(Value::Null),
    )
    .output(OutputSpec::records(
        "Host-Ports",
        &["ip", "protocol", "port"],
        "open ports per host",
    ))
    .output(OutputSpec::records(
        "*-IPs",
        &["ip"],
        "hosts with SSH, HTTP, HTTPS or other ports open (SSH-IPs, HTTP-IPs, HTTPS-IPs, Other-Port-IPs)",
    ))
    .output(OutputSpec::records(
        "Port-Errors",
        &["ip", "error"],
        "hosts that could not be scanned",
    ))
}

pub fn create(ctx: &mut StepContext, inputs: ModuleInputs) -> Result<Box<dyn Module>, ModuleError> {
    let ports = Ports::from_inputs(inputs)?;
    ctx.log(format!(
        "using IPs {:?} and protocols {:?}",
        ports.ips, ports.protocols
    ));
    Ok(Box::new(ports))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Ports {
    ips: Vec<String>,
    protocols: Vec<String>,
    ports: Option<String>,
    arguments: Vec<String>,
    binary: String,
}

impl Ports {
    pub fn from_inputs(inputs: ModuleInputs) -> Result<Self, ModuleError> {
        let protocols = take_string_list(&inputs, "protocols")?;
        if let Some(unknown) = protocols.iter().find(|p| protocol_flag(p).is_none()) {
            return Err(ModuleError::InvalidInput {
                input: "protocols".to_string(),
                reason: format!("unsupported protocol '{unknown}' (use tcp or udp)"),
            });
        }
        let arguments = match take_optional_string(&inputs, "arguments")? {
            Some(raw) => shell_words::split(&raw).map_err(|err| ModuleError::InvalidInput {
                input: "arguments".to_string(),
                reason: format!("failed to parse arguments: {err}"),
            })?,
            None => Vec::new(),
        };
        Ok(Self {
            ips: take_string_list(&inputs, "ips")?,
            protocols,
            ports: take_optional_string(&inputs, "ports")?,
            arguments,
            binary: "nmap".to_string(),
        })
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn command_args(&self, ip: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .protocols
            .iter()
            .filter_map(|protocol| protocol_flag(protocol))
            .map(str::to_string)
            .collect();
        // poor man's IPv6 detection
        if ip.contains(':') {
            args.push("-6".to_string());
        }
        args.extend(DEFAULT_ARGUMENTS.iter().map(|arg| arg.to_string()));
        args.extend(self.arguments.iter().cloned());
        if let Some(ports) = &self.ports {
            args.push("-p".to_string());
            args.push(ports.clone());
        }
        args.push("-oX".to_string());
        args.push("-".to_string());
        args.push(ip.to_string());
        args
    }

    fn scan(&self, ip: &str) -> Result<Vec<OpenPort>, String> {
        let output = Command::new(&self.binary)
            .args(self.command_args(ip))
            .output()
            .map_err(|err| format!("failed to spawn '{}': {err}", self.binary))?;
        if !output.status.success() {
            return Err(format!(
                "{} exited with code {:?}: {}",
                self.binary,
                output.status.code(),
                truncate_output(&output.stderr)
            ));
        }
        parse_nmap_xml(&output.stdout)
    }
}

impl Module for Ports {
    fn run(&mut self, ctx: &mut StepContext) -> Result<ModuleResults, ModuleError> {
        let mut open = Vec::new();
        let mut errors = Vec::new();
        for ip in &self.ips {
            ctx.log(format!("scanning {ip}"));
            match self.scan(ip) {
                Ok(ports) => {
                    ctx.log(format!("{ip}: {} open port(s)", ports.len()));
                    open.extend(ports.into_iter().map(|port| (ip.clone(), port)));
                }
                Err(error) => {
                    ctx.log(format!("{ip}: {error}"));
                    errors.push(error_record(ip, &error));
                }
            }
        }
        Ok(summarize(&open, errors))
    }
}

/// Groups open ports into the module's output lists.
pub fn summarize(open: &[(String, OpenPort)], errors: Vec<Record>) -> ModuleResults {
    let mut results = ModuleResults::new();
    results.insert(
        "Host-Ports".to_string(),
        open.iter()
            .map(|(ip, port)| {
                record(&[
                    ("ip", json!(ip)),
                    ("protocol", json!(port.protocol)),
                    ("port", json!(port.port)),
                ])
            })
            .collect(),
    );

    for (label, number) in NAMED_PORTS {
        let ips: BTreeSet<&str> = open
            .iter()
            .filter(|(_, port)| port.port == number)
            .map(|(ip, _)| ip.as_str())
            .collect();
        results.insert(format!("{label}-IPs"), ip_records(ips));
    }

    let other: BTreeSet<&str> = open
        .iter()
        .filter(|(_, port)| NAMED_PORTS.iter().all(|(_, number)| *number != port.port))
        .map(|(ip, _)| ip.as_str())
        .collect();
    results.insert("Other-Port-IPs".to_string(), ip_records(other));
    results.insert("Port-Errors".to_string(), errors);
    results
}

/// Extracts the open ports from nmap's XML report.
pub fn parse_nmap_xml(xml: &[u8]) -> Result<Vec<OpenPort>, String> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut open = Vec::new();
    let mut current_port: Option<PortBuilder> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) if element.name() == QName(b"port") => {
                current_port = Some(PortBuilder {
                    protocol: attribute(&element, b"protocol"),
                    port: attribute(&element, b"portid").and_then(|id| id.parse().ok()),
                    state: None,
                });
            }
            Ok(Event::Start(element)) | Ok(Event::Empty(element))
                if element.name() == QName(b"state") =>
            {
                if let Some(port) = current_port.as_mut() {
                    port.state = attribute(&element, b"state");
                }
            }
            Ok(Event::Start(element)) | Ok(Event::Empty(element))
                if element.name() == QName(b"finished") =>
            {
                if attribute(&element, b"exit").as_deref() == Some("error") {
                    let message = attribute(&element, b"errormsg")
                        .unwrap_or_else(|| "nmap reported an error".to_string());
                    return Err(message);
                }
            }
            Ok(Event::End(element)) if element.name() == QName(b"port") => {
                if let Some(port) = current_port.take().and_then(PortBuilder::finish_open) {
                    open.push(port);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("XML parsing error: {err}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(open)
}

#[derive(Default)]
struct PortBuilder {
    protocol: Option<String>,
    port: Option<u16>,
    state: Option<String>,
}

impl PortBuilder {
    fn finish_open(self) -> Option<OpenPort> {
        if self.state.as_deref() != Some("open") {
            return None;
        }
        Some(OpenPort {
            protocol: self.protocol.unwrap_or_else(|| "tcp".to_string()),
            port: self.port?,
        })
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
}

fn protocol_flag(protocol: &str) -> Option<&'static str> {
    match protocol {
        "tcp" => Some("-sT"),
        "udp" => Some("-sU"),
        _ => None,
    }
}

fn ip_records(ips: BTreeSet<&str>) -> Vec<Record> {
    ips.into_iter().map(|ip| record(&[("ip", json!(ip))])).collect()
}

fn error_record(ip: &str, error: &str) -> Record {
    record(&[("ip", json!(ip)), ("error", json!(error))])
}

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn truncate_output(bytes: &[u8]) -> String {
    const LIMIT: usize = 2000;
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(LIMIT).collect();
    truncated.push_str("...");
    truncated
}
