use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::runtime::model::*;
use crate::*;

/// The extension points of the message path and the module installer.
/// Registration against any other name is rejected.
pub const HOOK_IDS: &[&str] = &[
    "onSend",
    "preRoute",
    "preDeliver",
    "postDeliver",
    "onReceive",
    "postReceive",
    "onComplete",
    "preInstall",
    "postInstall",
    "preUninstall",
    "postUninstall",
];

/// What a hook chain carries. Routing hooks see the message and its
/// source/destination; installer hooks see an opaque value.
#[derive(Debug, Clone)]
pub enum HookPayload {
    Send(SendEvent),
    Receive(ReceiveEvent),
    Complete(CompleteEvent),
    Install(Variant),
}

#[derive(Debug, Clone)]
pub struct SendEvent {
    pub source_id: ElementId,
    pub source_port: usize,
    pub destination_id: Option<ElementId>,
    pub msg: MsgHandle,
}

#[derive(Debug, Clone)]
pub struct ReceiveEvent {
    pub destination_id: ElementId,
    pub msg: MsgHandle,
}

#[derive(Debug, Clone)]
pub struct CompleteEvent {
    pub node_id: ElementId,
    pub msg: MsgHandle,
}

impl HookPayload {
    pub fn msg(&self) -> Option<&MsgHandle> {
        match self {
            HookPayload::Send(e) => Some(&e.msg),
            HookPayload::Receive(e) => Some(&e.msg),
            HookPayload::Complete(e) => Some(&e.msg),
            HookPayload::Install(_) => None,
        }
    }
}

/// A handler's verdict: keep going, keep going with a new payload, or stop
/// the chain and suppress the action it guards.
#[derive(Debug)]
pub enum HookVerdict {
    Continue,
    Replace(HookPayload),
    Halt,
}

/// The overall result of a trigger.
#[derive(Debug)]
pub enum HookTriggerResult {
    Completed(HookPayload),
    Halted,
}

impl HookTriggerResult {
    pub fn is_halted(&self) -> bool {
        matches!(self, HookTriggerResult::Halted)
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, payload: HookPayload) -> crate::Result<HookVerdict>;
}

struct FnHookHandler<F>(F);

#[async_trait]
impl<F> HookHandler for FnHookHandler<F>
where
    F: Fn(HookPayload) -> crate::Result<HookVerdict> + Send + Sync,
{
    async fn handle(&self, payload: HookPayload) -> crate::Result<HookVerdict> {
        (self.0)(payload)
    }
}

struct HookEntry {
    label: Option<String>,
    removed: AtomicBool,
    handler: Arc<dyn HookHandler>,
}

/// Ordered, labelled handler chains keyed by hook id. Triggering awaits
/// handlers serially in registration order; entries removed mid-trigger
/// are skipped by their flag.
#[derive(Default)]
pub struct Hooks {
    chains: RwLock<HashMap<&'static str, Vec<Arc<HookEntry>>>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish()
    }
}

fn lookup_hook_id(id: &str) -> Option<&'static str> {
    HOOK_IDS.iter().find(|x| **x == id).copied()
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. `name` is `"hookId"` or `"hookId.label"`; the
    /// labelled form is required for later removal.
    pub fn add(&self, name: &str, handler: Arc<dyn HookHandler>) -> crate::Result<()> {
        let (id, label) = match name.split_once('.') {
            Some((id, label)) => (id, Some(label)),
            None => (name, None),
        };
        let id = lookup_hook_id(id)
            .ok_or(WireflowError::BadArgument("name"))
            .with_context(|| format!("Unknown hook id: '{}'", id))?;

        let mut chains = self.chains.write().expect("hooks lock");
        let chain = chains.entry(id).or_default();
        if let Some(label) = label {
            if chain.iter().any(|e| !e.removed.load(Ordering::SeqCst) && e.label.as_deref() == Some(label)) {
                return Err(WireflowError::InvalidOperation(format!(
                    "Hook '{}.{}' is already registered",
                    id, label
                ))
                .into());
            }
        }
        chain.push(Arc::new(HookEntry {
            label: label.map(|x| x.to_string()),
            removed: AtomicBool::new(false),
            handler,
        }));
        Ok(())
    }

    pub fn add_fn<F>(&self, name: &str, func: F) -> crate::Result<()>
    where
        F: Fn(HookPayload) -> crate::Result<HookVerdict> + Send + Sync + 'static,
    {
        self.add(name, Arc::new(FnHookHandler(func)))
    }

    /// Removes handlers by `"hookId.label"`, or every handler carrying the
    /// label with `"*.label"`. Unlabelled handlers cannot be removed.
    pub fn remove(&self, name: &str) -> crate::Result<usize> {
        let (id, label) = name
            .split_once('.')
            .filter(|(_, label)| !label.is_empty())
            .ok_or(WireflowError::BadArgument("name"))
            .with_context(|| "Only labelled hooks can be removed".to_string())?;

        let chains = self.chains.read().expect("hooks lock");
        let mut removed = 0;
        if id == "*" {
            for chain in chains.values() {
                removed += flag_removed(chain, label);
            }
        } else {
            let id = lookup_hook_id(id)
                .ok_or(WireflowError::BadArgument("name"))
                .with_context(|| format!("Unknown hook id: '{}'", id))?;
            if let Some(chain) = chains.get(id) {
                removed += flag_removed(chain, label);
            }
        }
        Ok(removed)
    }

    pub fn clear(&self) {
        self.chains.write().expect("hooks lock").clear();
    }

    pub fn has(&self, id: &str) -> bool {
        let chains = self.chains.read().expect("hooks lock");
        chains.get(id).map(|c| c.iter().any(|e| !e.removed.load(Ordering::SeqCst))).unwrap_or(false)
    }

    /// Runs the chain for `id`. A handler may replace the payload for its
    /// successors; a `Halt` verdict stops the chain and reports halted; a
    /// handler error aborts the trigger.
    pub async fn trigger(&self, id: &str, mut payload: HookPayload) -> crate::Result<HookTriggerResult> {
        let snapshot: Vec<Arc<HookEntry>> = {
            let chains = self.chains.read().expect("hooks lock");
            match chains.get(id) {
                Some(chain) => chain.clone(),
                None => return Ok(HookTriggerResult::Completed(payload)),
            }
        };

        for entry in snapshot.iter() {
            if entry.removed.load(Ordering::SeqCst) {
                continue;
            }
            match entry.handler.handle(payload.clone()).await {
                Ok(HookVerdict::Continue) => (),
                Ok(HookVerdict::Replace(new_payload)) => payload = new_payload,
                Ok(HookVerdict::Halt) => return Ok(HookTriggerResult::Halted),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Hook handler '{}{}' failed", id, match &entry.label {
                            Some(l) => format!(".{}", l),
                            None => String::new(),
                        })
                    });
                }
            }
        }
        Ok(HookTriggerResult::Completed(payload))
    }
}

fn flag_removed(chain: &[Arc<HookEntry>], label: &str) -> usize {
    let mut n = 0;
    for entry in chain.iter() {
        if entry.label.as_deref() == Some(label) && !entry.removed.swap(true, Ordering::SeqCst) {
            n += 1;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_payload() -> HookPayload {
        HookPayload::Send(SendEvent {
            source_id: ElementId::new(),
            source_port: 0,
            destination_id: None,
            msg: MsgHandle::with_payload(Variant::from(1)),
        })
    }

    #[tokio::test]
    async fn test_unknown_hook_id_is_rejected() {
        let hooks = Hooks::new();
        assert!(hooks.add_fn("noSuchHook", |_| Ok(HookVerdict::Continue)).is_err());
        assert!(hooks.add_fn("onSend.a", |_| Ok(HookVerdict::Continue)).is_ok());
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let hooks = Hooks::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            hooks
                .add_fn(&format!("onSend.{}", tag), move |p| {
                    order.lock().unwrap().push(tag);
                    Ok(HookVerdict::Replace(p))
                })
                .unwrap();
        }
        let res = hooks.trigger("onSend", send_payload()).await.unwrap();
        assert!(!res.is_halted());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_halt_skips_downstream_handlers() {
        let hooks = Hooks::new();
        let called = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        hooks.add_fn("onSend.halter", |_| Ok(HookVerdict::Halt)).unwrap();
        let called2 = called.clone();
        hooks
            .add_fn("onSend.after", move |_| {
                called2.fetch_add(1, Ordering::SeqCst);
                Ok(HookVerdict::Continue)
            })
            .unwrap();

        let res = hooks.trigger("onSend", send_payload()).await.unwrap();
        assert!(res.is_halted());
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_removed_handler_is_never_invoked() {
        let hooks = Hooks::new();
        let called = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let called2 = called.clone();
        hooks
            .add_fn("preDeliver.x", move |_| {
                called2.fetch_add(1, Ordering::SeqCst);
                Ok(HookVerdict::Continue)
            })
            .unwrap();
        assert_eq!(hooks.remove("preDeliver.x").unwrap(), 1);
        let _ = hooks.trigger("preDeliver", send_payload()).await.unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wildcard_remove_by_label() {
        let hooks = Hooks::new();
        hooks.add_fn("onSend.shared", |_| Ok(HookVerdict::Continue)).unwrap();
        hooks.add_fn("onReceive.shared", |_| Ok(HookVerdict::Continue)).unwrap();
        assert_eq!(hooks.remove("*.shared").unwrap(), 2);
        assert!(!hooks.has("onSend"));
        assert!(!hooks.has("onReceive"));
    }

    #[tokio::test]
    async fn test_replace_payload_is_seen_downstream() {
        let hooks = Hooks::new();
        hooks
            .add_fn("onReceive.rewriter", |p| {
                if let HookPayload::Receive(mut e) = p {
                    e.msg = MsgHandle::with_payload(Variant::from("rewritten"));
                    Ok(HookVerdict::Replace(HookPayload::Receive(e)))
                } else {
                    Ok(HookVerdict::Continue)
                }
            })
            .unwrap();

        let payload = HookPayload::Receive(ReceiveEvent {
            destination_id: ElementId::new(),
            msg: MsgHandle::with_payload(Variant::from("orig")),
        });
        match hooks.trigger("onReceive", payload).await.unwrap() {
            HookTriggerResult::Completed(HookPayload::Receive(e)) => {
                let guard = e.msg.read().await;
                assert_eq!(guard.get("payload").unwrap(), &Variant::from("rewritten"));
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_aborts_chain() {
        let hooks = Hooks::new();
        hooks.add_fn("onComplete.bad", |_| Err(WireflowError::invalid_operation("boom"))).unwrap();
        let res = hooks
            .trigger(
                "onComplete",
                HookPayload::Complete(CompleteEvent {
                    node_id: ElementId::new(),
                    msg: MsgHandle::default(),
                }),
            )
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_label_rejected() {
        let hooks = Hooks::new();
        hooks.add_fn("onSend.dup", |_| Ok(HookVerdict::Continue)).unwrap();
        assert!(hooks.add_fn("onSend.dup", |_| Ok(HookVerdict::Continue)).is_err());
    }
}
