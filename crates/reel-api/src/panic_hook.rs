//! Panic hook that routes faults into the drain path.

use std::panic::{take_hook, PanicHookInfo};

use tokio::sync::mpsc;

/// Log panics through `tracing` and report them on `faults`.
///
/// The previous hook still runs afterwards, so the default stderr output
/// and backtrace behaviour is kept.
pub fn install(faults: mpsc::UnboundedSender<String>) {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = describe(info);
            tracing::error!(target: "reel::panic", "{record}");
            // Receiver is gone once drain has started
            let _ = faults.send(record);
        }));

        previous_hook(info);
    }));
}

fn describe(info: &PanicHookInfo<'_>) -> String {
    let payload = if let Some(s) = info.payload().downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string payload>".to_string()
    };

    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());

    let thread = std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    format!("thread={} location={} payload={}", thread, location, payload)
}
