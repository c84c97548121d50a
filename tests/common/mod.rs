#![allow(dead_code)]

use async_trait::async_trait;
use exiting::{
    BoxError, CapturingTerminator, ExitRegistry, ExtHandler, ExtPoint, ListenerHandle, LogSink,
    Manager, ManagerOptions, Server, StopOptions,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Server that records its lifecycle and runs pre-stop handlers like a real one
#[derive(Default)]
pub struct TestServer {
    pub stops: AtomicUsize,
    pre_stop: Mutex<Vec<ExtHandler>>,
    listener: ListenerHandle,
}

impl TestServer {
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Server for TestServer {
    fn name(&self) -> &str {
        "test"
    }

    async fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn stop(&self, _options: StopOptions) -> Result<(), BoxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let handlers = self.pre_stop.lock().clone();
        for handler in handlers {
            handler().await?;
        }
        Ok(())
    }

    fn ext(&self, point: ExtPoint, handler: ExtHandler) {
        match point {
            ExtPoint::PreStop => self.pre_stop.lock().push(handler),
        }
    }

    fn listener(&self) -> ListenerHandle {
        self.listener.clone()
    }
}

pub struct Fixture {
    pub manager: Manager,
    pub registry: Arc<ExitRegistry>,
    pub terminator: Arc<CapturingTerminator>,
    pub server: Arc<TestServer>,
    pub logs: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    pub fn logged(&self, needle: &str) -> bool {
        self.logs.lock().iter().any(|line| line.contains(needle))
    }
}

/// A manager over one [`TestServer`] in its own registry
pub fn fixture(options: ManagerOptions) -> Fixture {
    let terminator = Arc::new(CapturingTerminator::new());
    let registry = ExitRegistry::with_terminator(terminator.clone());
    let server = Arc::new(TestServer::default());

    let logs = Arc::new(Mutex::new(Vec::new()));
    let sink: LogSink = {
        let logs = Arc::clone(&logs);
        Arc::new(move |message: &str| logs.lock().push(message.to_string()))
    };

    let manager =
        Manager::with_registry(Arc::clone(&registry), server.clone(), options.with_log(sink))
            .unwrap();

    Fixture {
        manager,
        registry,
        terminator,
        server,
        logs,
    }
}
