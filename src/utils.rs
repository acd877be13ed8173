// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{error::RollupError, l1::L1Client, transaction::Millis};
use ethers::{
    prelude::*,
    providers::Provider,
    signers::{coins_bip39::English, MnemonicBuilder},
};
use surf_disco::Url;

fn config_err(reason: impl ToString) -> RollupError {
    RollupError::Config {
        reason: reason.to_string(),
    }
}

/// Creates a provider for interacting with the L1 chain over HTTP.
pub fn create_provider(l1_url: &Url) -> Result<Provider<Http>, RollupError> {
    let mut provider = Provider::try_from(l1_url.to_string()).map_err(config_err)?;
    provider.set_interval(Duration::from_millis(10));
    Ok(provider)
}

/// Derives the node's L1 wallet from `mnemonic` at `account_index`.
pub fn wallet_from_mnemonic(
    mnemonic: &str,
    account_index: u32,
) -> Result<LocalWallet, RollupError> {
    MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .index(account_index)
        .map_err(config_err)?
        .build()
        .map_err(config_err)
}

/// Connects a signing client to L1, binding the wallet to the chain id the provider reports.
pub async fn connect_l1(
    l1_url: &Url,
    mnemonic: &str,
    account_index: u32,
) -> Result<Arc<L1Client>, RollupError> {
    let provider = create_provider(l1_url)?;
    let chain_id = provider
        .get_chainid()
        .await
        .map_err(|err| RollupError::L1Call {
            call: "chainId",
            reason: err.to_string(),
        })?;
    let wallet =
        wallet_from_mnemonic(mnemonic, account_index)?.with_chain_id(chain_id.low_u64());
    tracing::info!("connected to L1 chain {chain_id} as {:?}", wallet.address());
    Ok(Arc::new(SignerMiddleware::new(provider, wallet)))
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Millis)
        .unwrap_or_default()
}
