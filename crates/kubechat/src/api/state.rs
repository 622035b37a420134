//! Application state shared across handlers.

use crate::ws::KubeChat;

#[derive(Clone)]
pub struct AppState {
    pub kubechat: KubeChat,
    /// Bearer token for the admin endpoints. `None` disables them.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(kubechat: KubeChat, admin_token: Option<String>) -> Self {
        Self {
            kubechat,
            admin_token,
        }
    }
}
