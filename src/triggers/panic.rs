use super::UnhandledKind;
use crate::escape::ProcessExit;
use crate::manager::ManagerInner;
use std::panic::PanicHookInfo;
use std::sync::{Arc, Weak};

type PanicHook = dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static;

/// Chains onto the process panic hook and reports panics as uncaught exceptions
pub(super) struct PanicInterceptor {
    previous: Arc<PanicHook>,
}

impl PanicInterceptor {
    pub(super) fn install(manager: Weak<ManagerInner>) -> Self {
        let previous: Arc<PanicHook> = Arc::from(std::panic::take_hook());
        let chained = Arc::clone(&previous);

        std::panic::set_hook(Box::new(move |info| {
            // Unwinding with the escape marker is shutdown in progress
            if info.payload().downcast_ref::<ProcessExit>().is_some() {
                return;
            }

            (*chained)(info);

            if let Some(manager) = manager.upgrade() {
                manager.unhandled_error(UnhandledKind::Exception, &describe(info));
            }
        }));

        Self { previous }
    }

    pub(super) fn uninstall(self) {
        let previous = self.previous;
        std::panic::set_hook(Box::new(move |info| (*previous)(info)));
    }
}

fn describe(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    };

    match info.location() {
        Some(location) => format!("{} at {}:{}", message, location.file(), location.line()),
        None => message,
    }
}
