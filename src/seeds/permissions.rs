//! Permission catalog seeding
//!
//! The catalog is the cross product of the managed resources and the CRUD
//! actions. Seeding is idempotent: existing (resource, action) pairs are left
//! untouched.

use anyhow::{Context, Result};
use sea_orm::DatabaseConnection;

use crate::error::AuthError;
use crate::gateway::TransactionGateway;
use crate::repositories::PermissionRepository;

pub const RESOURCES: &[(&str, &str)] = &[
    ("users", "user_management"),
    ("roles", "user_management"),
    ("departments", "organization"),
    ("company", "organization"),
    ("invitations", "user_management"),
    ("audit_logs", "security"),
    ("sessions", "security"),
];

pub const ACTIONS: &[&str] = &["create", "read", "update", "delete"];

/// A built-in role and the permissions it is provisioned with.
#[derive(Debug, Clone, Copy)]
pub struct SystemRole {
    pub name: &'static str,
    pub description: &'static str,
    grants: fn(resource: &str, action: &str) -> bool,
}

impl SystemRole {
    pub fn grants(&self, resource: &str, action: &str) -> bool {
        (self.grants)(resource, action)
    }
}

pub const OWNER_ROLE: &str = "owner";

/// Highest privilege first.
pub const SYSTEM_ROLES: &[SystemRole] = &[
    SystemRole {
        name: OWNER_ROLE,
        description: "Full access to the organization",
        grants: grants_all,
    },
    SystemRole {
        name: "admin",
        description: "Manage everything except deleting the company",
        grants: grants_admin,
    },
    SystemRole {
        name: "manager",
        description: "Read access plus user and department updates",
        grants: grants_manager,
    },
    SystemRole {
        name: "member",
        description: "Read access to users, departments and company",
        grants: grants_member,
    },
];

fn grants_all(_resource: &str, _action: &str) -> bool {
    true
}

fn grants_admin(resource: &str, action: &str) -> bool {
    !(resource == "company" && action == "delete")
}

fn grants_manager(resource: &str, action: &str) -> bool {
    action == "read" || (action == "update" && matches!(resource, "users" | "departments"))
}

fn grants_member(resource: &str, action: &str) -> bool {
    action == "read" && matches!(resource, "users" | "departments" | "company")
}

/// Seed the global permission catalog.
pub async fn seed_permissions(db: &DatabaseConnection) -> Result<usize> {
    let gateway = TransactionGateway::new(db.clone());

    let total = gateway
        .run_with_bypass(|txn| async move {
            let repo = PermissionRepository::new(&txn);
            let before = repo.list_all().await?.len();

            for (resource, category) in RESOURCES {
                for action in ACTIONS {
                    let description = format!("{} {}", capitalize(action), resource.replace('_', " "));
                    repo.ensure(resource, action, category, Some(&description))
                        .await?;
                }
            }

            let after = repo.list_all().await?.len();
            Ok::<_, AuthError>((before, after))
        })
        .await
        .context("failed to seed permission catalog")?;

    let (before, after) = total;
    if after > before {
        log::info!("Seeded {} permissions ({} total)", after - before, after);
    } else {
        log::info!("Permission catalog already seeded ({} entries)", after);
    }
    Ok(after - before)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
