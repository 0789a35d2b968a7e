use std::sync::Arc;

use application::ChatGateway;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub gateway: ChatGateway,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(gateway: ChatGateway, jwt_service: Arc<JwtService>) -> Self {
        Self {
            gateway,
            jwt_service,
        }
    }
}
