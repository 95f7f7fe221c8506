use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Client,
    Freelancer,
    Admin,
    System,
}

impl ActorRole {
    pub fn to_str(&self) -> &str {
        match self {
            ActorRole::Client => "client",
            ActorRole::Freelancer => "freelancer",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemActor {
    PaymentGateway,
    AutoRelease,
    Scheduler,
}

impl SystemActor {
    pub fn to_str(&self) -> &str {
        match self {
            SystemActor::PaymentGateway => "payment-gateway",
            SystemActor::AutoRelease => "auto-release",
            SystemActor::Scheduler => "scheduler",
        }
    }
}

/// Whoever issued a command against a milestone or escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Client(Uuid),
    Freelancer(Uuid),
    Admin(Uuid),
    System(SystemActor),
}

impl Actor {
    pub fn role(&self) -> ActorRole {
        match self {
            Actor::Client(_) => ActorRole::Client,
            Actor::Freelancer(_) => ActorRole::Freelancer,
            Actor::Admin(_) => ActorRole::Admin,
            Actor::System(_) => ActorRole::System,
        }
    }

    pub fn from_role(role: ActorRole, user_id: Uuid) -> Option<Self> {
        match role {
            ActorRole::Client => Some(Actor::Client(user_id)),
            ActorRole::Freelancer => Some(Actor::Freelancer(user_id)),
            ActorRole::Admin => Some(Actor::Admin(user_id)),
            ActorRole::System => None,
        }
    }

    pub fn is_client(&self, client_id: Uuid) -> bool {
        matches!(self, Actor::Client(id) if *id == client_id)
    }

    pub fn is_freelancer(&self, freelancer_id: Uuid) -> bool {
        matches!(self, Actor::Freelancer(id) if *id == freelancer_id)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Client(id) => write!(f, "client:{}", id),
            Actor::Freelancer(id) => write!(f, "freelancer:{}", id),
            Actor::Admin(id) => write!(f, "admin:{}", id),
            Actor::System(system) => write!(f, "system:{}", system.to_str()),
        }
    }
}
