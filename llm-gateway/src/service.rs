//! Runtime bootstrap: builds the store, manager, router, and policy engine
//! from [`llm_gateway::config::Conf`], registers every background task
//! with a shared [`ShutdownHandle`], and binds the HTTP listener. Mirrors
//! the gateway's own `service.rs` task-registration pattern, trimmed to
//! this crate's surface (no Windows service wrapper, no ngrok).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use gateway_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use llm_gateway::audit::{AuditHook, LoggingAuditSink};
use llm_gateway::config::{Conf, SessionStoreKind};
use llm_gateway::manager;
use llm_gateway::policy::{PolicyConfig, PolicyEngine};
use llm_gateway::router::{Router, RouterConfig};
use llm_gateway::state::GatewayState;
use llm_gateway::store::memory::MemoryStore;
use llm_gateway::store::shared::SharedStore;
use llm_gateway::store::SessionStore;

pub struct GatewayService {
    shutdown_handle: ShutdownHandle,
    tasks: Vec<ChildTask<anyhow::Result<()>>>,
}

impl GatewayService {
    pub async fn start(conf: Conf) -> anyhow::Result<Self> {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let mut tasks = Vec::new();

        register(&mut tasks, gateway_log::LogDeleterTask { log_dir: conf.log_dir.clone() }, shutdown_signal.clone());

        let store: Arc<dyn SessionStore> = match conf.session_store {
            SessionStoreKind::Memory => Arc::new(MemoryStore::new()),
            SessionStoreKind::Shared => {
                let addr = conf.shared_store_addr.as_deref().context("shared store address missing")?;
                let (store, subscriber) = SharedStore::connect(addr, "llm-gateway:", conf.manager.idle_timeout.whole_seconds() as u64)
                    .await
                    .context("failed to connect to shared store")?;
                register(&mut tasks, subscriber, shutdown_signal.clone());
                Arc::new(store)
            }
        };

        let policy = Arc::new(PolicyEngine::new(PolicyConfig {
            threshold_rules: conf.policy_threshold_rules,
            content_rules: conf.policy_content_rules,
            capture_enabled: conf.policy_enabled && conf.policy_capture_enabled,
            max_capture_size: conf.policy_max_capture_size,
        }));

        let hook: Arc<dyn manager::EndOfSessionHook> = Arc::new(AuditHook::with_policy(LoggingAuditSink, Arc::clone(&policy)));
        let (manager, manager_task) = manager::new_manager(store, conf.manager, Some(hook));
        register(&mut tasks, manager_task, shutdown_signal.clone());

        let router = Router::new(RouterConfig {
            backends: conf.router_backends,
            selection_methods: conf.router_selection_methods,
            strict_model_matching: conf.router_strict_model_matching,
            blocked_models: conf.router_blocked_models,
        })
        .context("failed to build router")?;

        let state = GatewayState::new(manager, router, policy);
        let listen_addr = conf.listen_addr.clone();
        let app = llm_gateway::proxy::make_router(state);

        let listener = tokio::net::TcpListener::bind(&listen_addr).await.with_context(|| format!("failed to bind {listen_addr}"))?;
        info!(%listen_addr, "listening");

        let mut http_shutdown_signal = shutdown_signal.clone();
        let serve_future = axum::serve(listener, app).with_graceful_shutdown(async move {
            http_shutdown_signal.wait().await;
        });

        let http_task: ChildTask<anyhow::Result<()>> = ChildTask::spawn(async move { serve_future.await.map_err(anyhow::Error::from) });
        tasks.push(http_task);

        Ok(Self { shutdown_handle, tasks })
    }

    pub async fn stop(self) {
        self.shutdown_handle.signal();

        tokio::select! {
            () = self.shutdown_handle.all_closed() => {
                debug!("all tasks closed gracefully");
            }
            () = tokio::time::sleep(Duration::from_secs(10)) => {
                warn!("some tasks did not terminate in time");
            }
        }

        for task in self.tasks {
            task.abort();
        }
    }
}

fn register<T>(tasks: &mut Vec<ChildTask<anyhow::Result<()>>>, task: T, shutdown_signal: ShutdownSignal)
where
    T: gateway_task::Task<Output = anyhow::Result<()>> + 'static,
{
    tasks.push(gateway_task::spawn_task(task, shutdown_signal));
}
