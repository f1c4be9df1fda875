use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Starts components in attach order and stops them in reverse.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<dyn LifecycleComponent>>,
    started: usize,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            started: 0,
        }
    }

    pub fn attach(&mut self, component: Arc<dyn LifecycleComponent>) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// A failing component aborts startup after the ones already started
    /// are shut down again.
    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;

        for index in 0..self.components.len() {
            let comp = self.components[index].clone();
            if let Err(e) = comp.on_start().await {
                warn!("Component [{}] failed to start: {}", comp.name(), e);
                self.shutdown().await;
                return Err(e.context(format!("failed to start {}", comp.name())));
            }
            info!("Component [{}] started", comp.name());
            self.started += 1;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Best-effort; errors are logged and the remaining components still stop.
    pub async fn shutdown(&mut self) {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components[..self.started].iter().rev() {
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component [{}] shutdown error: {}", comp.name(), e);
            }
        }
        self.started = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
        fail_stop: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_start(&self) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("port in use");
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn on_shutdown(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_stop {
                anyhow::bail!("already gone");
            }
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
            fail_start: false,
            fail_stop: false,
        }
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        manager.attach(Arc::new(recorder("tools", &log)));
        let mut scheduler = recorder("scheduler", &log);
        scheduler.fail_stop = true;
        manager.attach(Arc::new(scheduler));
        manager.attach(Arc::new(recorder("api", &log)));

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await;
        assert_eq!(manager.state(), LifecycleState::Shutdown);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start tools",
                "start scheduler",
                "start api",
                "stop api",
                "stop scheduler",
                "stop tools"
            ]
        );
    }

    #[tokio::test]
    async fn failed_start_unwinds_started_components() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        manager.attach(Arc::new(recorder("tools", &log)));
        let mut api = recorder("api", &log);
        api.fail_start = true;
        manager.attach(Arc::new(api));

        let err = manager.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("port in use"));
        assert_eq!(*log.lock().unwrap(), vec!["start tools", "stop tools"]);
    }
}
