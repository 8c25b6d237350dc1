//! Live user → permission resolution.
//!
//! Nothing is cached between invocations. Robot accounts are treated as `write`
//! and denied users as `none` regardless of what the platform reports.

use std::collections::HashMap;

use futures::future::try_join_all;

use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::model::Permission;
use crate::platform::PlatformClient;

pub struct PermissionResolver<'a> {
    client: &'a dyn PlatformClient,
    robot_accounts: &'a [String],
    denied_users: &'a [String],
}

fn contains_user(list: &[String], user: &str) -> bool {
    let user = user.trim_start_matches('@');
    list.iter()
        .any(|u| u.trim_start_matches('@').eq_ignore_ascii_case(user))
}

impl<'a> PermissionResolver<'a> {
    pub fn new(client: &'a dyn PlatformClient, config: &'a ProcessorConfig) -> Self {
        PermissionResolver {
            client,
            robot_accounts: &config.robot_accounts,
            denied_users: &config.denied_users,
        }
    }

    pub fn is_denied(&self, user: &str) -> bool {
        contains_user(self.denied_users, user)
    }

    pub fn is_robot(&self, user: &str) -> bool {
        contains_user(self.robot_accounts, user)
    }

    pub async fn resolve(&self, user: &str) -> Result<Permission> {
        if self.is_denied(user) {
            return Ok(Permission::None);
        }
        if self.is_robot(user) {
            return Ok(Permission::Write);
        }
        self.client.get_user_permission(user).await
    }

    /// `(ok, actual)` where `ok` means `actual` is one of `required`.
    pub async fn check_permissions(
        &self,
        user: &str,
        required: &[Permission],
    ) -> Result<(bool, Permission)> {
        let actual = self.resolve(user).await?;
        Ok((required.contains(&actual), actual))
    }

    /// Resolve several users concurrently. Duplicates are queried once.
    pub async fn resolve_all<I, S>(&self, users: I) -> Result<HashMap<String, Permission>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = users.into_iter().map(|u| u.as_ref().to_string()).collect();
        unique.sort();
        unique.dedup();

        let levels = try_join_all(unique.iter().map(|u| self.resolve(u))).await?;
        Ok(unique.into_iter().zip(levels).collect())
    }
}
