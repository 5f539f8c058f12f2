//! Port range parsing and UDP port allocation
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
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Port specification meaning "let the OS choose"
pub const EPHEMERAL: &str = "0";

const MAX_PORT: u32 = u16::MAX as u32;

/// Half-open port interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u32,
    pub end: u32,
}

impl PortRange {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Sorted, merged set of port intervals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges {
    ranges: Vec<PortRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    First,
    Second,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy)]
enum ParseEvent {
    Digit(u32),
    Comma,
    Dash,
    EndOfInput,
    Other,
}

impl From<char> for ParseEvent {
    fn from(c: char) -> Self {
        match c {
            '0'..='9' => ParseEvent::Digit(c as u32 - '0' as u32),
            ',' => ParseEvent::Comma,
            '-' => ParseEvent::Dash,
            _ => ParseEvent::Other,
        }
    }
}

/// Character-level scanner for `N` / `N1-N2` lists
struct RangeParser {
    state: ParseState,
    first: u32,
    second: Option<u32>,
    parsed: Vec<PortRange>,
}

impl RangeParser {
    fn new() -> Self {
        RangeParser {
            state: ParseState::Start,
            first: 0,
            second: None,
            parsed: Vec::new(),
        }
    }

    fn on_event(&mut self, event: ParseEvent) {
        self.state = match (self.state, event) {
            (ParseState::Start, ParseEvent::Digit(d)) => {
                self.first = d;
                self.second = None;
                ParseState::First
            }
            (ParseState::First, ParseEvent::Digit(d)) => match accumulate(self.first, d) {
                Some(n) => {
                    self.first = n;
                    ParseState::First
                }
                None => ParseState::Error,
            },
            (ParseState::First, ParseEvent::Comma) => {
                self.push(self.first, self.first);
                ParseState::Start
            }
            (ParseState::First, ParseEvent::Dash) => ParseState::Second,
            (ParseState::First, ParseEvent::EndOfInput) => {
                self.push(self.first, self.first);
                ParseState::Success
            }
            (ParseState::Second, ParseEvent::Digit(d)) => {
                match accumulate(self.second.unwrap_or(0), d) {
                    Some(n) => {
                        self.second = Some(n);
                        ParseState::Second
                    }
                    None => ParseState::Error,
                }
            }
            (ParseState::Second, ParseEvent::Comma) => match self.second {
                Some(last) => {
                    self.push(self.first, last);
                    ParseState::Start
                }
                None => ParseState::Error,
            },
            (ParseState::Second, ParseEvent::EndOfInput) => match self.second {
                Some(last) => {
                    self.push(self.first, last);
                    ParseState::Success
                }
                None => ParseState::Error,
            },
            _ => ParseState::Error,
        };
    }

    /// Inclusive bounds in, half-open interval out
    fn push(&mut self, first: u32, last: u32) {
        self.parsed.push(PortRange {
            start: first,
            end: last + 1,
        });
    }
}

fn accumulate(value: u32, digit: u32) -> Option<u32> {
    let n = value * 10 + digit;
    (n <= MAX_PORT).then_some(n)
}

impl PortRanges {
    /// Parse a specification such as `"5000-5100,6000"`.
    ///
    /// Intervals are sorted and merged; a reversed pair is rejected.
    pub fn parse(spec: &str) -> RelayResult<Self> {
        let mut parser = RangeParser::new();
        for c in spec.chars() {
            parser.on_event(ParseEvent::from(c));
            if parser.state == ParseState::Error {
                break;
            }
        }
        if parser.state != ParseState::Error {
            parser.on_event(ParseEvent::EndOfInput);
        }
        if parser.state != ParseState::Success {
            return Err(RelayError::InvalidRange(spec.to_string()));
        }

        let mut parsed = parser.parsed;
        parsed.sort();

        let mut ranges: Vec<PortRange> = Vec::with_capacity(parsed.len());
        for range in parsed {
            if range.is_empty() {
                return Err(RelayError::InvalidRange(format!(
                    "{}: reversed interval {}-{}",
                    spec,
                    range.start,
                    range.end - 1
                )));
            }
            match ranges.last_mut() {
                Some(prev) if prev.end >= range.start => prev.end = prev.end.max(range.end),
                _ => ranges.push(range),
            }
        }

        // port 0 asks the OS for any port; only the literal `"0"` may do that
        if ranges.first().is_some_and(|r| r.start == 0) {
            return Err(RelayError::InvalidRange(format!(
                "{}: port 0 cannot be part of a range",
                spec
            )));
        }

        Ok(PortRanges { ranges })
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    /// Number of ports across all intervals
    pub fn size(&self) -> u32 {
        self.ranges.iter().map(PortRange::len).sum()
    }

    /// Map a logical offset onto a port
    pub fn port_at(&self, mut offset: u32) -> Option<u16> {
        for range in &self.ranges {
            if offset < range.len() {
                return u16::try_from(range.start + offset).ok();
            }
            offset -= range.len();
        }
        None
    }

    /// Every port once, starting at `start` and wrapping around
    pub fn bind_order(&self, start: u32) -> impl Iterator<Item = u16> + '_ {
        let size = self.size();
        let start = if size == 0 { 0 } else { start % size };
        (0..size).filter_map(move |step| self.port_at((start + step) % size))
    }
}

impl fmt::Display for PortRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if range.len() == 1 {
                write!(f, "{}", range.start)?;
            } else {
                write!(f, "{}-{}", range.start, range.end - 1)?;
            }
        }
        Ok(())
    }
}

/// Walk `ranges` from `start` until `try_bind` succeeds
pub async fn allocate_with<T, F, Fut>(
    ranges: &PortRanges,
    start: u32,
    mut try_bind: F,
) -> RelayResult<T>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    for port in ranges.bind_order(start) {
        trace!(port, "Trying to open port");
        match try_bind(port).await {
            Ok(bound) => return Ok(bound),
            Err(e) => trace!(port, error = %e, "Port not usable"),
        }
    }

    Err(RelayError::PortUnavailable(format!(
        "no available port in {}",
        ranges
    )))
}

/// Bind a UDP socket on `iface` with a port taken from `spec`
pub async fn bind_udp(spec: &str, iface: &str) -> RelayResult<UdpSocket> {
    let ip: Ipv4Addr = iface
        .parse()
        .map_err(|_| RelayError::InvalidArgument(format!("invalid interface: {}", iface)))?;

    if spec == EPHEMERAL {
        let socket = UdpSocket::bind(SocketAddr::from((ip, 0))).await?;
        debug!(addr = ?socket.local_addr().ok(), "Bound ephemeral port");
        return Ok(socket);
    }

    let ranges = PortRanges::parse(spec)?;
    let start = rand::thread_rng().gen_range(0..ranges.size());
    let socket = allocate_with(&ranges, start, |port| {
        UdpSocket::bind(SocketAddr::from((ip, port)))
    })
    .await?;

    debug!(addr = ?socket.local_addr().ok(), ranges = %ranges, "Bound port from range");
    Ok(socket)
}
