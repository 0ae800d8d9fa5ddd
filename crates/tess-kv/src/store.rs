use std::sync::Arc;
use std::time::Duration;

use tess_consensus::{ConsensusHost, Session};
use tess_shard::{ShardRouter, TransactionManager};
use tess_types::command::{KvEnvelope, KvPayload};
use tess_types::{AccountId, KeyValue, TessError, Transaction};

use crate::requests::*;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_account(account: AccountId) -> Result<(), TessError> {
    if account == 0 {
        return Err(TessError::InvalidAccount);
    }
    Ok(())
}

fn check_owner(owner: &str) -> Result<(), TessError> {
    if owner.is_empty() {
        return Err(TessError::InvalidOwner);
    }
    Ok(())
}

fn check_bucket(name: &str) -> Result<(), TessError> {
    if name.is_empty() {
        return Err(TessError::InvalidBucketName);
    }
    Ok(())
}

fn check_key(key: &[u8]) -> Result<(), TessError> {
    if key.is_empty() {
        return Err(TessError::InvalidKey);
    }
    Ok(())
}

fn unexpected(payload: &KvPayload) -> TessError {
    TessError::Codec(format!("unexpected reply {}", payload.kind()))
}

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Account, bucket and key operations routed to the owning shard.
///
/// Malformed requests fail before any consensus round trip.
pub struct KvStore<H> {
    host: Arc<H>,
    router: Arc<ShardRouter>,
    transactions: Arc<TransactionManager<H>>,
    timeout: Duration,
}

impl<H: ConsensusHost> KvStore<H> {
    pub fn new(
        host: Arc<H>,
        router: Arc<ShardRouter>,
        transactions: Arc<TransactionManager<H>>,
        timeout: Duration,
    ) -> Self {
        KvStore { host, router, transactions, timeout }
    }

    fn session(&self, account: AccountId, tx: Option<&Transaction>) -> Session {
        if let Some(tx) = tx {
            match self.transactions.session_from_client_id(tx.client_id) {
                Some(session) => return session,
                None => tracing::warn!(
                    client_id = tx.client_id,
                    shard_id = tx.shard_id,
                    "transaction session missing, proposing without one"
                ),
            }
        }
        self.host.get_noop_session(self.router.account_to_shard(account))
    }

    /// Proposes `env` and returns the reply payload together with the
    /// descriptor to hand back to the caller.
    async fn propose(
        &self,
        env: KvEnvelope,
        tx: Option<Transaction>,
    ) -> Result<(KvPayload, Transaction), TessError> {
        let session = self.session(env.account, tx.as_ref());
        let cmd = env.encode()?;
        let out = self.host.sync_propose(&session, cmd, self.timeout).await?;

        let descriptor = match tx {
            Some(tx) if !session.is_noop() => self.transactions.commit(&tx),
            Some(tx) => tx,
            None => Transaction::default(),
        };
        let reply = KvEnvelope::decode(&out).inspect_err(|e| {
            tracing::error!(shard_id = session.shard_id, error = %e, "undecodable kv reply");
        })?;
        Ok((reply.into_result()?, descriptor))
    }

    pub async fn create_account(
        &self,
        req: CreateAccountRequest,
    ) -> Result<CreateAccountResponse, TessError> {
        check_account(req.account)?;
        check_owner(&req.owner)?;
        let env = KvEnvelope::new(req.account, "", KvPayload::CreateAccountRequest { owner: req.owner });
        match self.propose(env, req.transaction).await? {
            (KvPayload::CreateAccountReply { account }, transaction) => {
                tracing::debug!(account = req.account, "account created");
                Ok(CreateAccountResponse { account, transaction })
            }
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn delete_account(
        &self,
        req: DeleteAccountRequest,
    ) -> Result<DeleteAccountResponse, TessError> {
        check_account(req.account)?;
        check_owner(&req.owner)?;
        let env = KvEnvelope::new(req.account, "", KvPayload::DeleteAccountRequest { owner: req.owner });
        match self.propose(env, req.transaction).await? {
            (KvPayload::DeleteAccountReply { ok }, transaction) => {
                Ok(DeleteAccountResponse { ok, transaction })
            }
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn create_bucket(
        &self,
        req: CreateBucketRequest,
    ) -> Result<CreateBucketResponse, TessError> {
        check_account(req.account)?;
        check_owner(&req.owner)?;
        check_bucket(&req.name)?;
        let env =
            KvEnvelope::new(req.account, req.name, KvPayload::CreateBucketRequest { owner: req.owner });
        match self.propose(env, req.transaction).await? {
            (KvPayload::CreateBucketReply { bucket }, transaction) => {
                Ok(CreateBucketResponse { bucket, transaction })
            }
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn delete_bucket(
        &self,
        req: DeleteBucketRequest,
    ) -> Result<DeleteBucketResponse, TessError> {
        check_account(req.account)?;
        check_bucket(&req.name)?;
        let env = KvEnvelope::new(req.account, req.name, KvPayload::DeleteBucketRequest);
        match self.propose(env, req.transaction).await? {
            (KvPayload::DeleteBucketReply { ok }, transaction) => {
                Ok(DeleteBucketResponse { ok, transaction })
            }
            (other, _) => Err(unexpected(&other)),
        }
    }

    /// Linearizable read from the shard that owns the account.
    pub async fn get_key(&self, req: GetKeyRequest) -> Result<GetKeyResponse, TessError> {
        check_account(req.account)?;
        check_bucket(&req.bucket)?;
        check_key(&req.key)?;
        let shard_id = self.router.account_to_shard(req.account);
        let env = KvEnvelope::new(req.account, req.bucket, KvPayload::GetKeyRequest { key: req.key });
        let out = self.host.sync_read(shard_id, env.encode()?, self.timeout).await?;
        match KvEnvelope::decode(&out)?.into_result()? {
            KvPayload::GetKeyReply { kv } => Ok(GetKeyResponse {
                kv,
                transaction: req.transaction.unwrap_or_default(),
            }),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn put_key(&self, req: PutKeyRequest) -> Result<PutKeyResponse, TessError> {
        check_account(req.account)?;
        check_bucket(&req.bucket)?;
        check_key(&req.key)?;
        let kv = KeyValue { key: req.key, value: req.value, lease: req.lease, ..Default::default() };
        let env = KvEnvelope::new(req.account, req.bucket, KvPayload::PutKeyRequest { kv });
        match self.propose(env, req.transaction).await? {
            (KvPayload::PutKeyReply { kv }, transaction) => Ok(PutKeyResponse { kv, transaction }),
            (other, _) => Err(unexpected(&other)),
        }
    }

    pub async fn delete_key(&self, req: DeleteKeyRequest) -> Result<DeleteKeyResponse, TessError> {
        check_account(req.account)?;
        check_bucket(&req.bucket)?;
        check_key(&req.key)?;
        let env = KvEnvelope::new(req.account, req.bucket, KvPayload::DeleteKeyRequest { key: req.key });
        match self.propose(env, req.transaction).await? {
            (KvPayload::DeleteKeyReply { ok }, transaction) => Ok(DeleteKeyResponse { ok, transaction }),
            (other, _) => Err(unexpected(&other)),
        }
    }
}
