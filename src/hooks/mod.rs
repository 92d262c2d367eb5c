//! Server-side hooks
//!
//! Extensibility points for applications embedding the engine: a hook
//! behaves as a virtual subscriber without a network client, and may
//! also veto incoming connections. Hooks run synchronously inside the
//! engine's lock domain.

use crate::protocol::{ConnectReturnCode, QoS};

/// Maximum number of registered hooks, bounded by the width of
/// [`HookMap`] (two bits of enrollment state per hook).
pub const MAX_HOOKS: usize = 4;

const SLOT_MASK: u8 = 0x03;

/// Per-topic-node hook enrollment: a 2-bit field per hook holding the
/// enrolled QoS, with 3 meaning "not enrolled".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookMap(u8);

impl HookMap {
    /// No hook enrolled
    pub const DEFAULT: HookMap = HookMap(0xFF);

    pub fn is_default(self) -> bool {
        self == HookMap::DEFAULT
    }

    pub fn enroll(&mut self, hook: usize, qos: QoS) {
        let shift = (hook * 2) as u8;
        self.0 = (self.0 & !(SLOT_MASK << shift)) | ((qos as u8) << shift);
    }

    pub fn cancel(&mut self, hook: usize) {
        let shift = (hook * 2) as u8;
        self.0 |= SLOT_MASK << shift;
    }

    pub fn qos_for(self, hook: usize) -> Option<QoS> {
        let field = (self.0 >> (hook * 2)) & SLOT_MASK;
        QoS::from_u8(field)
    }
}

impl Default for HookMap {
    fn default() -> Self {
        HookMap::DEFAULT
    }
}

/// Application hook: connect authorization, message delivery and
/// disconnect notification. All methods default to no-op/allow.
pub trait Hook: Send {
    /// Authorize an incoming CONNECT. Returning an error refuses the
    /// connection with that CONNACK code.
    fn on_connect(
        &mut self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<(), ConnectReturnCode> {
        Ok(())
    }

    /// Deliver a message published to a topic this hook enrolled in
    fn on_publish(&mut self, _topic: &str, _payload: &[u8], _dup: bool, _qos: QoS, _retain: bool) {}

    /// A client's network connection has closed
    fn on_disconnect(&mut self, _client_id: &str, _due_to_error: bool) {}
}

/// Fixed table of registered hooks
pub struct HookRegistry {
    slots: [Option<Box<dyn Hook>>; MAX_HOOKS],
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            slots: [None, None, None, None],
        }
    }

    /// Register a hook, returning its id. Fails when all slots are
    /// taken.
    pub fn register(&mut self, hook: Box<dyn Hook>) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.is_none())?;
        self.slots[idx] = Some(hook);
        Some(idx)
    }

    pub fn deregister(&mut self, hook: usize) {
        if hook < MAX_HOOKS {
            self.slots[hook] = None;
        }
    }

    pub fn is_registered(&self, hook: usize) -> bool {
        hook < MAX_HOOKS && self.slots[hook].is_some()
    }

    /// Run connect authorization through every hook; the first refusal
    /// wins.
    pub fn authorize_connect(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<(), ConnectReturnCode> {
        for slot in self.slots.iter_mut().flatten() {
            slot.on_connect(client_id, username, password)?;
        }
        Ok(())
    }

    /// Deliver a publish to every hook enrolled in `map`, at the
    /// minimum of the enrolled and published QoS.
    pub fn publish(
        &mut self,
        map: HookMap,
        topic: &str,
        payload: &[u8],
        dup: bool,
        qos: QoS,
        retain: bool,
    ) {
        for idx in 0..MAX_HOOKS {
            let Some(enrolled) = map.qos_for(idx) else {
                continue;
            };
            if let Some(hook) = self.slots[idx].as_mut() {
                hook.on_publish(topic, payload, dup, enrolled.min(qos), retain);
            }
        }
    }

    pub fn notify_disconnect(&mut self, client_id: &str, due_to_error: bool) {
        for slot in self.slots.iter_mut().flatten() {
            slot.on_disconnect(client_id, due_to_error);
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        HookRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_map_enroll_and_cancel() {
        let mut map = HookMap::DEFAULT;
        assert!(map.is_default());
        assert_eq!(map.qos_for(2), None);

        map.enroll(2, QoS::AtLeastOnce);
        assert!(!map.is_default());
        assert_eq!(map.qos_for(2), Some(QoS::AtLeastOnce));
        assert_eq!(map.qos_for(0), None);

        map.cancel(2);
        assert!(map.is_default());
    }

    struct Veto;

    impl Hook for Veto {
        fn on_connect(
            &mut self,
            _client_id: &str,
            _username: Option<&str>,
            _password: Option<&[u8]>,
        ) -> Result<(), ConnectReturnCode> {
            Err(ConnectReturnCode::NotAuthorized)
        }
    }

    #[test]
    fn first_refusal_wins() {
        let mut reg = HookRegistry::new();
        reg.register(Box::new(Veto)).unwrap();
        assert_eq!(
            reg.authorize_connect("cl", None, None),
            Err(ConnectReturnCode::NotAuthorized)
        );
    }
}
