// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

//! Pluggable authentication and authorization hooks.

use async_trait::async_trait;

/// Authentication and authorization hooks consulted by the broker.
///
/// Every hook returns `Ok(true)` to allow, `Ok(false)` to deny, or `Err` when
/// the hook itself failed; a failure drops the stream and surfaces an error
/// event, a deny answers with CONNACK code 5 (authenticate) or closes the
/// connection after unsubscribing it (publish/subscribe).
#[async_trait]
pub trait Security: Send + Sync {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> anyhow::Result<bool>;

    async fn authorize_publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> anyhow::Result<bool>;

    async fn authorize_subscribe(&self, client_id: &str, filter: &str) -> anyhow::Result<bool>;
}

/// Default security policy: everything is allowed.
pub struct AllowAll;

#[async_trait]
impl Security for AllowAll {
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn authorize_publish(
        &self,
        _client_id: &str,
        _topic: &str,
        _payload: &[u8],
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn authorize_subscribe(&self, _client_id: &str, _filter: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}
