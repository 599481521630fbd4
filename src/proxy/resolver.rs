//! Transform resolution
//!
//! Decides, once per exchange and before anything is forwarded, whether the
//! upstream response passes through untouched, has scripts injected into its
//! HTML, or is decoded as JSON and handed to interception listeners.

use crate::infrastructure::log_messages::interception;
use crate::proxy::event_bus::{InterceptEvent, InterceptionBus};
use crate::proxy::headers::paths;
use crate::proxy::types::{DumpName, Hostname, InterceptedExchange, ProxyMethod};
use http::Method;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Request target fragment identifying the battle page
pub const BATTLE_PAGE_MARKER: &str = "/battle/?";

/// Request target fragment identifying the battle-init-data endpoint
pub const BATTLE_INIT_DATA_MARKER: &str = "get_battle_init_data";

/// Literal marker the script block is inserted before
pub const CLOSING_BODY_MARKER: &str = "</body>";

/// Text rewrite applied to a fully buffered document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextRewrite {
    insertion: String,
}

impl TextRewrite {
    pub fn insert_before_closing_body(insertion: impl Into<String>) -> Self {
        Self {
            insertion: insertion.into(),
        }
    }

    /// Insert before the first `</body>`; content without one is returned unchanged
    pub fn apply(&self, content: &str) -> String {
        match content.find(CLOSING_BODY_MARKER) {
            Some(at) => {
                let mut rewritten = String::with_capacity(content.len() + self.insertion.len());
                rewritten.push_str(&content[..at]);
                rewritten.push_str(&self.insertion);
                rewritten.push_str(&content[at..]);
                rewritten
            }
            None => content.to_string(),
        }
    }
}

/// How the upstream response of one exchange is handled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransformDecision {
    NoTransform,
    TextInject(TextRewrite),
    JsonIntercept {
        event: InterceptEvent,
        dump: DumpName,
    },
}

impl TransformDecision {
    /// Whether the pipeline needs the whole body in memory
    pub fn buffers_body(&self) -> bool {
        !matches!(self, Self::NoTransform)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoTransform => "none",
            Self::TextInject(_) => "text_inject",
            Self::JsonIntercept { .. } => "json_intercept",
        }
    }
}

/// Builds the script block appended to the battle page
#[derive(Clone, Debug)]
pub struct ScriptInjector {
    origin: SocketAddr,
    scripts: Vec<String>,
}

impl ScriptInjector {
    /// Scripts are served by the asset server at `local_ip:port`
    pub fn new(local_ip: IpAddr, port: u16, scripts: Vec<String>) -> Self {
        Self {
            origin: SocketAddr::new(local_ip, port),
            scripts,
        }
    }

    pub fn script_url(&self, name: &str) -> String {
        format!("http://{}{}/{name}.js", self.origin, paths::SCRIPTS)
    }

    /// Inline namespace declaration followed by one external tag per script
    pub fn script_block(&self) -> String {
        let mut block =
            String::from(r#"<script type="application/javascript">var inject = {};</script>"#);
        for name in &self.scripts {
            block.push_str(&format!(
                r#"<script type="application/javascript" src="{}"></script>"#,
                self.script_url(name)
            ));
        }
        block
    }

    pub fn rewrite(&self) -> TextRewrite {
        TextRewrite::insert_before_closing_body(self.script_block())
    }
}

/// Classifies exchanges against the configured domains and proxy method
#[derive(Debug)]
pub struct TransformResolver {
    domains: HashSet<Hostname>,
    method: ProxyMethod,
    injector: ScriptInjector,
    bus: Arc<InterceptionBus>,
}

impl TransformResolver {
    pub fn new(
        domains: impl IntoIterator<Item = Hostname>,
        method: ProxyMethod,
        injector: ScriptInjector,
        bus: Arc<InterceptionBus>,
    ) -> Self {
        Self {
            domains: domains.into_iter().collect(),
            method,
            injector,
            bus,
        }
    }

    /// First match wins: bodiless method, foreign host, battle page injection,
    /// battle-init interception
    pub fn resolve(&self, exchange: &InterceptedExchange) -> TransformDecision {
        // HEAD responses carry the framing of a body that never arrives
        if exchange.method == Method::HEAD {
            return TransformDecision::NoTransform;
        }
        let Some(host) = exchange.host() else {
            return TransformDecision::NoTransform;
        };
        if !self.domains.contains(&host) {
            return TransformDecision::NoTransform;
        }

        let target = exchange.request_url.as_str();
        match self.method {
            ProxyMethod::Inject if target.contains(BATTLE_PAGE_MARKER) => {
                debug!(id = %exchange.id, "Injecting scripts into battle page");
                TransformDecision::TextInject(self.injector.rewrite())
            }
            ProxyMethod::Intercept if target.contains(BATTLE_INIT_DATA_MARKER) => {
                let event = InterceptEvent::BattleInitData;
                let listeners = self.bus.listener_count(event);
                info!(%event, listeners, "{}", interception::LISTENER_COUNT);

                if listeners == 0 {
                    return TransformDecision::NoTransform;
                }
                match DumpName::try_new(BATTLE_INIT_DATA_MARKER) {
                    Ok(dump) => TransformDecision::JsonIntercept { event, dump },
                    Err(_) => TransformDecision::NoTransform,
                }
            }
            _ => TransformDecision::NoTransform,
        }
    }
}
