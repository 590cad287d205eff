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

//! Password verification.
//!
//! Credentials are an immutable username → secret map built once at
//! startup and shared by every connection. Verification compares in
//! constant time, and an unknown username still performs a comparison
//! against a fixed dummy secret, so a lookup miss and a password
//! mismatch are indistinguishable to the peer in both timing and reply.

use std::collections::HashMap;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::User;

/// Stand-in secret compared against when the username is unknown.
const DUMMY_SECRET: &[u8] = b"tinyssh-dummy-credential-0000000";

/// Immutable credential map for password authentication.
pub struct CredentialSet {
    users: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl CredentialSet {
    pub fn new(users: &[User]) -> Self {
        let users = users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    Zeroizing::new(u.password.as_bytes().to_vec()),
                )
            })
            .collect();
        Self { users }
    }

    /// Check `password` for `username` in constant time.
    ///
    /// Returns only a bool: callers must not surface which of the two
    /// failure causes (unknown user, wrong password) occurred.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let offered = Zeroizing::new(password.as_bytes().to_vec());

        match self.users.get(username) {
            Some(expected) => expected.as_slice().ct_eq(offered.as_slice()).into(),
            None => {
                // Burn the same comparison work for unknown users.
                let _ = DUMMY_SECRET.ct_eq(offered.as_slice());
                false
            }
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> CredentialSet {
        CredentialSet::new(&[
            User {
                username: "demo".into(),
                password: "pw".into(),
            },
            User {
                username: "ops".into(),
                password: "hunter2".into(),
            },
        ])
    }

    #[test]
    fn test_correct_password_accepted() {
        assert!(creds().verify("demo", "pw"));
        assert!(creds().verify("ops", "hunter2"));
    }

    #[test]
    fn test_wrong_password_rejected() {
        assert!(!creds().verify("demo", "pW"));
        assert!(!creds().verify("demo", ""));
        assert!(!creds().verify("demo", "pw "));
    }

    #[test]
    fn test_unknown_user_rejected() {
        assert!(!creds().verify("root", "pw"));
        assert!(!creds().verify("", "pw"));
    }

    #[test]
    fn test_password_valid_only_for_its_user() {
        assert!(!creds().verify("demo", "hunter2"));
        assert!(!creds().verify("ops", "pw"));
    }

    #[test]
    fn test_user_count() {
        assert_eq!(creds().user_count(), 2);
        assert_eq!(CredentialSet::new(&[]).user_count(), 0);
    }
}
