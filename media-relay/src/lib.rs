//! STUN-based media relay agent
//!
//! Opens UDP transports on request, answers ICE connectivity checks to learn
//! where the remote peer really is, and relays RTP/RTCP between a local and a
//! remote side, optionally through SRTP. An operator drives it line by line
//! through [`ControlDispatcher`].
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


pub mod control;
pub mod dispatcher;
pub mod error;
pub mod ice;
pub mod point;
pub mod ranges;
pub mod registry;
pub mod stream;
pub mod stun_codec;
pub mod transform;
pub mod transport;

pub use control::ControlMessage;
pub use dispatcher::{Command, ControlDispatcher, DispatchOutcome};
pub use error::{RelayError, RelayResult};
pub use point::{IceCredentials, RelayPoint};
pub use ranges::PortRanges;
pub use registry::{PointConfig, RelayState};
pub use stream::Stream;
pub use stun_codec::{StunAttribute, StunMessage, StunMessageType};
pub use transform::{SecureTransform, TransformMode};
pub use transport::{ConnectionId, Transport};
