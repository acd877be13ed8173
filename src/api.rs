// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use async_std::sync::RwLock;
use async_trait::async_trait;
use derive_more::From;
use ethers::{
    abi::Address,
    types::{H256, U256},
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::{io, sync::Arc, time::Duration};
use surf_disco::{Client, Url};
use tide_disco::{error::ServerError, Api, App};

use crate::{
    error::RollupError,
    l1::L1Contract,
    sequencer::Sequencer,
    state::{Amount, Nonce, StateSnapshot},
    transaction::{SignedTransaction, Transaction, TxId, TxLeaf},
    verifier::PrestateSource,
};

#[derive(Clone, Debug)]
pub struct APIOptions {
    pub api_port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TxId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errormsg: Option<String>,
}

impl From<Result<TxId, RollupError>> for SubmitResponse {
    fn from(result: Result<TxId, RollupError>) -> Self {
        match result {
            Ok(id) => Self {
                success: true,
                id: Some(id),
                errormsg: None,
            },
            Err(err) => Self {
                success: false,
                id: None,
                errormsg: Some(err.to_string()),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, From, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: Amount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, From, Serialize, Deserialize)]
pub struct NonceResponse {
    pub nonce: Nonce,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txdata: Option<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errormsg: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<H256>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batchid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf: Option<TxLeaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errormsg: Option<String>,
}

fn bad_request(message: &str) -> ServerError {
    ServerError {
        status: tide_disco::StatusCode::BadRequest,
        message: message.into(),
    }
}

fn parse_address(address: &str) -> Result<Address, ServerError> {
    address.parse::<Address>().map_err(|_| {
        bad_request(
            "Malformed address. Ensure that the address is valid hex encoded Ethereum address.",
        )
    })
}

const MALFORMED_TRANSACTION: &str =
    "Malformed transaction. Ensure that the transaction is a JSON serialized SignedTransaction";

/*
Serves the sequencer's HTTP API.

 # Routes (module `rollup`)
 - `POST transfer`, `POST withdraw`: queue a signed transaction.
 - `GET balance/:address`, `GET nonce/:address`: account queries.
 - `GET status/:id`: a transaction and its status.
 - `GET proof/:id`: merkle proof of a finalized withdrawal.
 - `GET prestate/:batch_id`: the state before a batch, which verifiers replay from.

 Rejections and unknown ids are answered with `{success: false, errormsg}`. Only malformed
 parameters or bodies produce a `400`.
*/
pub async fn serve<L: L1Contract + 'static>(
    options: &APIOptions,
    sequencer: Sequencer<L>,
) -> io::Result<()> {
    type StateType<L> = Arc<RwLock<Sequencer<L>>>;
    let error_mapper = |err| io::Error::new(io::ErrorKind::Other, err);
    let state = Arc::new(RwLock::new(sequencer));
    let mut app = App::<StateType<L>, ServerError>::with_state(state);
    let toml = toml::from_str::<toml::Value>(include_str!("api.toml"))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let mut api = Api::<StateType<L>, ServerError>::new(toml).map_err(error_mapper)?;

    api.post("transfer", |req, sequencer| {
        async move {
            let transaction = req
                .body_auto::<SignedTransaction>()
                .map_err(|_| bad_request(MALFORMED_TRANSACTION))?;
            Ok(SubmitResponse::from(
                sequencer.submit_transfer(&transaction).await,
            ))
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    api.post("withdraw", |req, sequencer| {
        async move {
            let transaction = req
                .body_auto::<SignedTransaction>()
                .map_err(|_| bad_request(MALFORMED_TRANSACTION))?;
            Ok(SubmitResponse::from(
                sequencer.submit_withdrawal(&transaction).await,
            ))
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    api.get("balance", |req, sequencer| {
        async move {
            let address = parse_address(&req.string_param("address")?)?;
            Ok(BalanceResponse::from(sequencer.balance(&address).await))
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    api.get("nonce", |req, sequencer| {
        async move {
            let address = parse_address(&req.string_param("address")?)?;
            Ok(NonceResponse::from(sequencer.nonce(&address).await))
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    api.get("status", |req, sequencer| {
        async move {
            let id: TxId = req.integer_param("id")?;
            Ok(match sequencer.status(id).await {
                Some(tx) => StatusResponse {
                    success: true,
                    txdata: Some(tx),
                    errormsg: None,
                },
                None => StatusResponse {
                    success: false,
                    txdata: None,
                    errormsg: Some(format!("Transaction not found for id {id}")),
                },
            })
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    api.get("proof", |req, sequencer| {
        async move {
            let id: TxId = req.integer_param("id")?;
            Ok(match sequencer.withdrawal_proof(id).await {
                Ok(proof) => ProofResponse {
                    success: true,
                    proof: Some(proof.proof),
                    batchid: Some(proof.batch_id),
                    leaf: Some(proof.leaf),
                    errormsg: None,
                },
                Err(err) => ProofResponse {
                    success: false,
                    proof: None,
                    batchid: None,
                    leaf: None,
                    errormsg: Some(err.to_string()),
                },
            })
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    api.get("prestate", |req, sequencer| {
        async move {
            let batch_id: u64 = req.integer_param("batch_id")?;
            sequencer
                .prestate(batch_id)
                .await
                .map_err(|err| ServerError {
                    status: tide_disco::StatusCode::NotFound,
                    message: err.to_string(),
                })
        }
        .boxed()
    })
    .map_err(error_mapper)?;

    app.register_module("rollup", api)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    app.serve(format!("0.0.0.0:{}", options.api_port)).await
}

/// Client for the sequencer API, used by verifiers and wallets.
#[derive(Clone)]
pub struct SequencerClient {
    client: Client<ServerError>,
}

fn query_err(err: ServerError) -> RollupError {
    RollupError::SequencerQuery {
        reason: err.to_string(),
    }
}

impl SequencerClient {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(url),
        }
    }

    /// Wait for the sequencer to come up. Returns `false` if it did not within `timeout`.
    pub async fn connect(&self, timeout: Option<Duration>) -> bool {
        self.client.connect(timeout).await
    }

    pub async fn transfer(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<SubmitResponse, RollupError> {
        self.submit("rollup/transfer", transaction).await
    }

    pub async fn withdraw(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<SubmitResponse, RollupError> {
        self.submit("rollup/withdraw", transaction).await
    }

    async fn submit(
        &self,
        route: &str,
        transaction: &SignedTransaction,
    ) -> Result<SubmitResponse, RollupError> {
        self.client
            .post::<SubmitResponse>(route)
            .body_json(transaction)
            .map_err(query_err)?
            .send()
            .await
            .map_err(query_err)
    }

    pub async fn balance(&self, address: &Address) -> Result<U256, RollupError> {
        let response = self
            .client
            .get::<BalanceResponse>(&format!("rollup/balance/{address:?}"))
            .send()
            .await
            .map_err(query_err)?;
        Ok(response.balance)
    }

    pub async fn nonce(&self, address: &Address) -> Result<Nonce, RollupError> {
        let response = self
            .client
            .get::<NonceResponse>(&format!("rollup/nonce/{address:?}"))
            .send()
            .await
            .map_err(query_err)?;
        Ok(response.nonce)
    }

    pub async fn status(&self, id: TxId) -> Result<StatusResponse, RollupError> {
        self.client
            .get(&format!("rollup/status/{id}"))
            .send()
            .await
            .map_err(query_err)
    }

    pub async fn proof(&self, id: TxId) -> Result<ProofResponse, RollupError> {
        self.client
            .get(&format!("rollup/proof/{id}"))
            .send()
            .await
            .map_err(query_err)
    }
}

#[async_trait]
impl PrestateSource for SequencerClient {
    async fn prestate(&self, batch_id: u64) -> Result<StateSnapshot, RollupError> {
        self.client
            .get(&format!("rollup/prestate/{batch_id}"))
            .send()
            .await
            .map_err(query_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        l1::EventCursor,
        sequencer::{SequencerConfig, SequencerState},
        state::StateMap,
        testing::MockL1,
        transaction::{TxMessage, TxStatus},
        verifier::{Verdict, Verifier, VerifierConfig, VerifierState},
    };
    use async_std::task::spawn;
    use ethers::signers::{LocalWallet, Signer};
    use portpicker::pick_unused_port;
    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    const GENESIS_BALANCE: u64 = 9999;

    fn signed(
        wallet: &LocalWallet,
        target: Option<Address>,
        value: u64,
        nonce: u64,
    ) -> SignedTransaction {
        SignedTransaction::new(
            TxMessage {
                target,
                value: value.into(),
                nonce,
            },
            wallet,
        )
        .unwrap()
    }

    #[async_std::test]
    async fn query_test() {
        let l1 = Arc::new(MockL1::default());
        let sequencer = Sequencer::new(
            l1.clone(),
            SequencerConfig::default(),
            SequencerState::new(EventCursor::new(0, 100)),
        );
        let genesis_wallet = LocalWallet::new(&mut ChaChaRng::seed_from_u64(0));
        let genesis_address = genesis_wallet.address();
        let bob = LocalWallet::new(&mut ChaChaRng::seed_from_u64(1)).address();
        l1.deposit(genesis_address, GENESIS_BALANCE.into());
        sequencer.listen().await.unwrap();
        assert_eq!(sequencer.run_batch_cycle().await.unwrap(), Some(0));

        let port = pick_unused_port().expect("No ports free");
        let api_url: Url = format!("http://localhost:{port}").parse().unwrap();
        let options = APIOptions { api_port: port };
        let served = sequencer.clone();
        spawn(async move { serve(&options, served).await });

        let client = SequencerClient::new(api_url);
        assert!(client.connect(None).await);

        // Fetch the deposited balance
        assert_eq!(
            client.balance(&genesis_address).await.unwrap(),
            U256::from(GENESIS_BALANCE)
        );
        assert_eq!(client.nonce(&genesis_address).await.unwrap(), 1);

        let transfer = client
            .transfer(&signed(&genesis_wallet, Some(bob), 100, 1))
            .await
            .unwrap();
        assert!(transfer.success);
        let withdrawal = client
            .withdraw(&signed(&genesis_wallet, None, 10, 2))
            .await
            .unwrap();
        assert!(withdrawal.success);
        let no_target = client
            .transfer(&signed(&genesis_wallet, None, 1, 3))
            .await
            .unwrap();
        assert!(!no_target.success);
        assert!(no_target.errormsg.is_some());

        assert_eq!(sequencer.run_batch_cycle().await.unwrap(), Some(1));
        assert_eq!(client.balance(&bob).await.unwrap(), U256::from(100));

        let status = client.status(transfer.id.unwrap()).await.unwrap();
        assert!(status.success);
        let txdata = status.txdata.unwrap();
        assert_eq!(txdata.status, TxStatus::AcceptedInL1);
        assert_eq!(txdata.batch_id, Some(1));
        let missing = client.status(999).await.unwrap();
        assert!(!missing.success);

        let proof = client.proof(withdrawal.id.unwrap()).await.unwrap();
        assert!(!proof.success);
        assert_eq!(
            proof.errormsg.as_deref(),
            Some("Transaction is yet to be finalized")
        );

        let mut after_deposit = StateMap::genesis();
        after_deposit.credit(genesis_address, GENESIS_BALANCE.into());
        assert_eq!(
            client.prestate(1).await.unwrap(),
            after_deposit.snapshot()
        );
        assert!(client.prestate(7).await.is_err());

        // A verifier replays both batches from pre-states served over HTTP.
        let verifier = Verifier::new(
            l1.clone(),
            Arc::new(client.clone()),
            VerifierConfig::default(),
            VerifierState::new(EventCursor::new(0, 100)),
        );
        assert_eq!(
            verifier.listen().await.unwrap(),
            vec![(0, Verdict::Valid), (1, Verdict::Valid)]
        );
    }
}
