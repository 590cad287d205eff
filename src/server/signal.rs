// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! SSH wire signal → OS signal translation.

use nix::sys::signal::Signal;
use russh::Sig;

/// Map a `signal` channel-request name onto an OS signal.
///
/// A leading `SIG` prefix is tolerated (some clients send `SIGTERM`
/// instead of the RFC 4254 `TERM`). Names outside the supported set
/// translate to `None`: the request is acknowledged but nothing is
/// delivered to the child.
pub fn wire_signal_to_os(signal: &Sig) -> Option<Signal> {
    let name: &str = match signal {
        Sig::HUP => "HUP",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::QUIT => "QUIT",
        Sig::TERM => "TERM",
        Sig::Custom(name) => name.as_str(),
        _ => return None,
    };

    match name.strip_prefix("SIG").unwrap_or(name) {
        "HUP" => Some(Signal::SIGHUP),
        "INT" => Some(Signal::SIGINT),
        "KILL" => Some(Signal::SIGKILL),
        "QUIT" => Some(Signal::SIGQUIT),
        "TERM" => Some(Signal::SIGTERM),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_names() {
        assert_eq!(wire_signal_to_os(&Sig::INT), Some(Signal::SIGINT));
        assert_eq!(wire_signal_to_os(&Sig::TERM), Some(Signal::SIGTERM));
        assert_eq!(wire_signal_to_os(&Sig::KILL), Some(Signal::SIGKILL));
        assert_eq!(wire_signal_to_os(&Sig::QUIT), Some(Signal::SIGQUIT));
        assert_eq!(wire_signal_to_os(&Sig::HUP), Some(Signal::SIGHUP));
    }

    #[test]
    fn test_sig_prefix_stripped() {
        assert_eq!(
            wire_signal_to_os(&Sig::Custom("SIGTERM".into())),
            Some(Signal::SIGTERM)
        );
        assert_eq!(
            wire_signal_to_os(&Sig::Custom("SIGINT".into())),
            Some(Signal::SIGINT)
        );
    }

    #[test]
    fn test_custom_plain_names() {
        assert_eq!(
            wire_signal_to_os(&Sig::Custom("HUP".into())),
            Some(Signal::SIGHUP)
        );
    }

    #[test]
    fn test_unsupported_signals_ignored() {
        assert_eq!(wire_signal_to_os(&Sig::USR1), None);
        assert_eq!(wire_signal_to_os(&Sig::SEGV), None);
        assert_eq!(wire_signal_to_os(&Sig::Custom("WINCH".into())), None);
        assert_eq!(wire_signal_to_os(&Sig::Custom("".into())), None);
        // A bare prefix is not a signal name.
        assert_eq!(wire_signal_to_os(&Sig::Custom("SIG".into())), None);
    }
}
