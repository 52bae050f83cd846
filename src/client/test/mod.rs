
mod state_auth;
mod state_timeout;
