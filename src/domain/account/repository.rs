//! Account table

use crate::domain::account::entity::Account;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::AccountId;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry of configured accounts, always holding the IP2IP account.
///
/// Owned by the link and injected wherever accounts are read. Lookups hand
/// out clones so no lock outlives the call that took it.
pub struct AccountTable {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl AccountTable {
    pub fn new(ip2ip_port: u16) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(AccountId::ip2ip(), Account::ip2ip(ip2ip_port));
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    pub async fn insert(&self, account: Account) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.id) {
            return Err(DomainError::AccountExists(account.id.clone()));
        }
        debug!(account = %account.id, "Account added");
        accounts.insert(account.id.clone(), account);
        Ok(())
    }

    pub async fn get(&self, id: &AccountId) -> Option<Account> {
        self.accounts.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &AccountId) -> Result<Account> {
        self.get(id)
            .await
            .ok_or_else(|| DomainError::AccountNotFound(id.clone()))
    }

    /// Apply `f` to the stored account under the write lock.
    pub async fn update<F, T>(&self, id: &AccountId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Account) -> T,
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| DomainError::AccountNotFound(id.clone()))?;
        Ok(f(account))
    }

    pub async fn remove(&self, id: &AccountId) -> Result<Account> {
        if id.is_ip2ip() {
            return Err(DomainError::InvalidOperation(
                "The IP2IP account cannot be removed".to_string(),
            ));
        }
        self.accounts
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DomainError::AccountNotFound(id.clone()))
    }

    pub async fn ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Account owning an incoming request addressed to `user` and sent from
    /// `host`: full match, then user match, then host match, then IP2IP.
    pub async fn find_for_incoming(&self, user: &str, host: &str) -> AccountId {
        let accounts = self.accounts.read().await;
        let candidates: Vec<&Account> = accounts
            .values()
            .filter(|a| a.enabled && !a.is_ip2ip())
            .collect();

        let found = candidates
            .iter()
            .find(|a| a.full_match(user, host))
            .or_else(|| candidates.iter().find(|a| a.user_match(user)))
            .or_else(|| candidates.iter().find(|a| a.hostname_match(host)));

        match found {
            Some(account) => account.id.clone(),
            None => AccountId::ip2ip(),
        }
    }
}
