//! Integration tests spanning the core components and the infra
//! collaborators

#[cfg(test)]
mod preamp_integration;
