//! Account provisioning and balance refresh

use crate::chain::ChainClient;
use crate::error::RelayerResult;
use crate::model::Account;
use crate::state::Store;

use chrono::Utc;
use tracing::{info, warn};

/// Create an account on the client's chain, generating a key pair when
/// no address is given, then fetch its balance
pub async fn provision_account(
    store: &dyn Store,
    client: &dyn ChainClient,
    name: Option<String>,
    address: Option<String>,
) -> RelayerResult<Account> {
    let mut account = Account::new(client.chain_id(), address);
    account.name = name;

    if account.address.is_none() {
        let (address, secret) = client.generate_key().await?;
        account.address = Some(address);
        account.secret = Some(secret);
    }

    if let Some(address) = &account.address {
        account.balance = client.balance(address).await?;
    }
    store.save_account(&account).await?;

    info!(
        "Provisioned account {} on chain {}",
        account,
        client.chain_id()
    );
    Ok(account)
}

/// Fetch the balance of one account, persisting it only when it changed
pub async fn refresh_balance(
    store: &dyn Store,
    client: &dyn ChainClient,
    account: &mut Account,
) -> RelayerResult<bool> {
    let address = match &account.address {
        Some(address) => address.clone(),
        None => return Ok(false),
    };

    let balance = client.balance(&address).await?;
    if balance == account.balance {
        return Ok(false);
    }

    account.balance = balance;
    account.updated_at = Utc::now();
    store.save_account(account).await?;
    crate::metrics::record_account_balance(client.chain_id(), &address, balance);
    Ok(true)
}

/// Refresh every account of the client's chain, returns how many changed
pub async fn refresh_balances(store: &dyn Store, client: &dyn ChainClient) -> RelayerResult<usize> {
    let mut changed = 0;

    for mut account in store.accounts(client.chain_id()).await? {
        match refresh_balance(store, client, &mut account).await {
            Ok(true) => changed += 1,
            Ok(false) => {}
            Err(e) => warn!("Failed to refresh balance of {}: {}", account, e),
        }
    }

    info!(
        "Refreshed balances on chain {}: {} changed",
        client.chain_id(),
        changed
    );
    Ok(changed)
}
