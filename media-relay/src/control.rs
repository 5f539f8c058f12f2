//! Line-oriented control messages
//!
//! A request line is a type followed by `name=value` arguments:
//! `OPEN_CONN port=50000-50100 iface=0.0.0.0`. Replies are rendered as
//! `type=OPEN_CONN_OK id=udp://0.0.0.0:50012/ port=50012 ...`.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{RelayError, RelayResult};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};

const TYPE_ARG: &str = "type";

/// Control request or reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMessage {
    message_type: String,
    args: BTreeMap<String, String>,
}

impl ControlMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        ControlMessage {
            message_type: message_type.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn set_type(&mut self, message_type: impl Into<String>) {
        self.message_type = message_type.into();
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    /// Argument value, treating an empty value as absent
    pub fn non_empty_arg(&self, name: &str) -> Option<&str> {
        self.arg(name).filter(|v| !v.is_empty())
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.args.contains_key(name)
    }

    /// Set an argument; `type` sets the message type instead
    pub fn set_arg(&mut self, name: &str, value: impl Into<String>) {
        if name == TYPE_ARG {
            self.set_type(value);
        } else {
            self.args.insert(name.to_string(), value.into());
        }
    }

    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// Copy of this message, with every argument, under a new type
    pub fn reply(&self, message_type: &str) -> ControlMessage {
        ControlMessage {
            message_type: message_type.to_string(),
            args: self.args.clone(),
        }
    }

    /// Scan one line.
    ///
    /// A bare word before any argument is the type; `name=value` pairs are
    /// separated by single spaces.
    pub fn parse_line(line: &str) -> RelayResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut message = ControlMessage::default();
        let mut name = String::new();
        let mut value = String::new();
        let mut in_value = false;

        for c in line.chars() {
            if in_value {
                if c == ' ' {
                    message.set_arg(&name, std::mem::take(&mut value));
                    name.clear();
                    in_value = false;
                } else {
                    value.push(c);
                }
            } else if c == '=' {
                value.clear();
                in_value = true;
            } else if c == ' ' {
                if message.args.is_empty() && !name.is_empty() {
                    message.set_type(std::mem::take(&mut name));
                }
                name.clear();
            } else {
                name.push(c);
            }
        }

        if !name.is_empty() {
            if !value.is_empty() {
                message.set_arg(&name, value);
            } else if message.args.is_empty() {
                message.set_type(name);
            }
        }

        if message.message_type.is_empty() {
            return Err(RelayError::ProtocolViolation(format!(
                "no message type in {:?}",
                line
            )));
        }
        Ok(message)
    }

    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", TYPE_ARG, self.message_type)?;
        for (name, value) in &self.args {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

/// Parse `udp://<ipv4>:<port>`, with or without a trailing `/`
pub fn parse_udp_address(value: &str) -> Option<SocketAddr> {
    let rest = value.split_once("://").map_or(value, |(_, rest)| rest);
    rest.trim_end_matches('/')
        .parse::<SocketAddrV4>()
        .ok()
        .map(SocketAddr::V4)
}
