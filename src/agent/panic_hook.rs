use std::backtrace::Backtrace;
use std::sync::Arc;
use crate::agent::Agent;
use crate::zone::ExecutionId;

/// Installs a panic hook that reports every panic as an `Exception` event named
/// `panic`, then hands over to the previously installed hook.
///
/// The hook only holds a weak reference: once every [`Agent`] handle is gone
/// it just forwards to the previous hook.
pub fn install_panic_hook(agent: &Agent) {
    let weak = Arc::downgrade(&agent.inner);
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        if let Some(inner) = weak.upgrade() {
            let payload = info.payload();
            let reason = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Box<dyn Any>".to_string()
            };

            let location = info
                .location()
                .map(|l| format!("at {}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_default();
            let stack = format!("{location}\n{}", Backtrace::force_capture());

            inner.report_exception(ExecutionId::current(), "panic", &reason, &stack);
        }

        previous(info);
    }));
}
