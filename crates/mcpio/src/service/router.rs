//! Method-name based dispatch table implementing [`Service`].

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    model::{ErrorData, JsonRpcNotification, JsonRpcRequest},
    service::{NotificationContext, RequestContext, Service},
};

type RequestHandler = Arc<
    dyn Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<Value, ErrorData>>
        + Send
        + Sync,
>;
type NotificationHandler =
    Arc<dyn Fn(Option<Value>, NotificationContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Routes requests and notifications to per-method handlers.
///
/// Unknown requests get a method-not-found error; unknown notifications are
/// logged and dropped.
///
/// ```rust,no_run
/// # use mcpio::service::Router;
/// let router = Router::new().request_handler("echo", |params, _ctx| async move {
///     Ok(params.unwrap_or_default())
/// });
/// ```
#[derive(Clone, Default)]
pub struct Router {
    requests: HashMap<Cow<'static, str>, RequestHandler>,
    notifications: HashMap<Cow<'static, str>, NotificationHandler>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("notifications", &self.notifications.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_handler<F, Fut>(
        mut self,
        method: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> Self
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorData>> + Send + 'static,
    {
        self.requests.insert(
            method.into(),
            Arc::new(move |params, context| Box::pin(handler(params, context))),
        );
        self
    }

    pub fn notification_handler<F, Fut>(
        mut self,
        method: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> Self
    where
        F: Fn(Option<Value>, NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notifications.insert(
            method.into(),
            Arc::new(move |params, context| Box::pin(handler(params, context))),
        );
        self
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }
}

impl Service for Router {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> Result<Value, ErrorData> {
        match self.requests.get(request.method.as_str()) {
            Some(handler) => handler(request.params, context).await,
            None => Err(ErrorData::method_not_found(&request.method)),
        }
    }

    async fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        context: NotificationContext,
    ) {
        match self.notifications.get(notification.method.as_str()) {
            Some(handler) => handler(notification.params, context).await,
            None => {
                tracing::debug!(method = %notification.method, "no handler for notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_methods_are_visible() {
        let router = Router::new()
            .request_handler("echo", |params, _| async move {
                Ok(params.unwrap_or_default())
            })
            .notification_handler("noop", |_, _| async {});
        assert!(router.has_request_handler("echo"));
        assert!(!router.has_request_handler("missing"));
    }
}
