use crate::config::Settings;
use crate::sessions::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub sessions: SessionStore,
}
