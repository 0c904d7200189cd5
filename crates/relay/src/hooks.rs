//! Per-message mutation hooks.
//!
//! Hooks are registered by message name at startup and run between decode
//! and re-encode. A missing hook is a no-op and a faulty hook must never
//! break the tunnel: failures are logged at debug and swallowed, and any
//! mutation made before the failure is kept.

use std::collections::HashMap;

use anyhow::Context as _;
use prost_reflect::ReflectMessage;
use prost_reflect::Value;
use tracing::debug;

use relay_shared::config::AccountOverride;
use relay_shared::keys::derive_session_key;

use crate::codec::Message;
use crate::session::SessionState;

pub type HookFn = Box<dyn Fn(&mut Message, &mut SessionState) -> anyhow::Result<()> + Send + Sync>;

/// Name-keyed table of registered mutation hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, hook: HookFn) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// The built-in hooks: account override on the login request, key
    /// rotation on the login response.
    pub fn with_builtins(account: Option<AccountOverride>) -> Self {
        let mut registry = Self::new();
        if let Some(account) = account {
            registry.register(
                "GetPlayerTokenReq",
                Box::new(move |msg, _state| apply_account_override(msg, &account)),
            );
        }
        registry.register(
            "GetPlayerTokenRsp",
            Box::new(|msg, state| rotate_from_seed(msg, state)),
        );
        registry
    }

    /// Runs the hook for `name`, if any. Failures are swallowed.
    pub fn apply(&self, name: &str, message: &mut Message, state: &mut SessionState) {
        let Some(hook) = self.hooks.get(name) else {
            return;
        };
        if let Err(err) = hook(message, state) {
            debug!(
                target: "relay::net::hooks",
                "hook for {name} failed on {}: {err:#}",
                state.identity
            );
        }
    }
}

fn set_string_field(message: &mut Message, field: &str, value: &str) -> anyhow::Result<()> {
    let descriptor = message
        .descriptor()
        .get_field_by_name(field)
        .with_context(|| format!("message has no field {field:?}"))?;
    message.set_field(&descriptor, Value::String(value.to_string()));
    Ok(())
}

fn apply_account_override(message: &mut Message, account: &AccountOverride) -> anyhow::Result<()> {
    set_string_field(message, "account_uid", &account.uid)?;
    set_string_field(message, "account_token", &account.token)?;
    Ok(())
}

/// Reads the 64-bit key seed from the login response and rotates the
/// session onto its derived key.
fn rotate_from_seed(message: &mut Message, state: &mut SessionState) -> anyhow::Result<()> {
    let seed = message
        .get_field_by_name("secret_key_seed")
        .and_then(|value| value.as_u64())
        .context("login response carries no key seed")?;
    state.rotate(derive_session_key(seed));
    Ok(())
}
