use std::sync::Arc;

use tess_types::command::{ErrorCode, ErrorMessage, KvEnvelope, KvPayload};
use tess_types::{
    decode, encode, AccountDescriptor, AccountId, BucketDescriptor, KeyValue, TessError,
};

use crate::now_ns;
use crate::traits::{BatchOp, BucketDump, BucketStore, StateMachine};

const DESCRIPTOR_KEY: &[u8] = b"_descriptor";
const MONOTONIC_BUCKET: &str = "monotonic";
const INDEX_KEY: &[u8] = b"index";

fn account_bucket(account: AccountId) -> String {
    format!("acct/{account}")
}

fn data_bucket(account: AccountId, bucket: &str) -> String {
    format!("acct/{account}/{bucket}")
}

fn bucket_descriptor_key(bucket: &str) -> Vec<u8> {
    format!("bucket/{bucket}").into_bytes()
}

/// Outcome of applying one envelope.
enum Failure {
    /// Reported to the proposer inside the reply envelope.
    Recoverable(ErrorMessage),
    /// The entry could not be applied at all.
    Fatal(TessError),
}

impl From<TessError> for Failure {
    fn from(e: TessError) -> Self {
        Failure::Fatal(e)
    }
}

fn recoverable(code: ErrorCode, message: impl Into<String>) -> Failure {
    Failure::Recoverable(ErrorMessage::new(code, message))
}

type Applied = (KvPayload, Vec<BatchOp>);

// ---------------------------------------------------------------------------
// KvStateMachine
// ---------------------------------------------------------------------------

/// Account/bucket/key state machine over a `BucketStore`.
///
/// Each account owns bucket `acct/<id>` holding its descriptor and one
/// descriptor per user bucket; user data lives in `acct/<id>/<bucket>`.
/// Every applied entry, successful or not, advances the `monotonic/index`
/// cursor in the same write batch.
pub struct KvStateMachine {
    store: Arc<dyn BucketStore>,
}

impl KvStateMachine {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        KvStateMachine { store }
    }

    fn account(&self, account: AccountId) -> Result<Option<AccountDescriptor>, TessError> {
        self.store
            .get(&account_bucket(account), DESCRIPTOR_KEY)?
            .map(|b| decode::<AccountDescriptor>(&b))
            .transpose()
    }

    fn bucket(
        &self,
        account: AccountId,
        bucket: &str,
    ) -> Result<Option<BucketDescriptor>, TessError> {
        self.store
            .get(&account_bucket(account), &bucket_descriptor_key(bucket))?
            .map(|b| decode::<BucketDescriptor>(&b))
            .transpose()
    }

    fn key(&self, account: AccountId, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>, TessError> {
        self.store
            .get(&data_bucket(account, bucket), key)?
            .map(|b| decode::<KeyValue>(&b))
            .transpose()
    }

    fn apply(&self, index: u64, env: KvEnvelope) -> Result<Applied, Failure> {
        let KvEnvelope { account, bucket, payload } = env;
        match payload {
            KvPayload::CreateAccountRequest { owner } => self.create_account(account, owner),
            KvPayload::DeleteAccountRequest { .. } => self.delete_account(account),
            KvPayload::CreateBucketRequest { owner } => self.create_bucket(account, &bucket, owner),
            KvPayload::DeleteBucketRequest => self.delete_bucket(account, &bucket),
            KvPayload::PutKeyRequest { kv } => self.put_key(index, account, &bucket, kv),
            KvPayload::DeleteKeyRequest { key } => self.delete_key(account, &bucket, &key),
            other => Err(recoverable(
                ErrorCode::Aborted,
                format!("{} is not a valid proposal", other.kind()),
            )),
        }
    }

    fn create_account(&self, account: AccountId, owner: String) -> Result<Applied, Failure> {
        if self.account(account)?.is_some() {
            return Err(recoverable(
                ErrorCode::AlreadyExists,
                format!("account {account} already exists"),
            ));
        }
        let now = now_ns();
        let desc = AccountDescriptor {
            account_id: account,
            owner,
            created_ns: now,
            last_updated_ns: now,
            bucket_count: 0,
            buckets: Vec::new(),
        };
        let ops = vec![BatchOp::put(&account_bucket(account), DESCRIPTOR_KEY, encode(&desc)?)];
        Ok((KvPayload::CreateAccountReply { account: desc }, ops))
    }

    fn delete_account(&self, account: AccountId) -> Result<Applied, Failure> {
        let Some(desc) = self.account(account)? else {
            return Ok((KvPayload::DeleteAccountReply { ok: false }, Vec::new()));
        };
        let mut ops: Vec<BatchOp> = desc
            .buckets
            .iter()
            .map(|b| BatchOp::DeleteBucket { bucket: data_bucket(account, b) })
            .collect();
        ops.push(BatchOp::DeleteBucket { bucket: account_bucket(account) });
        Ok((KvPayload::DeleteAccountReply { ok: true }, ops))
    }

    fn create_bucket(
        &self,
        account: AccountId,
        bucket: &str,
        owner: String,
    ) -> Result<Applied, Failure> {
        let Some(mut desc) = self.account(account)? else {
            return Err(recoverable(
                ErrorCode::AccountNotFound,
                format!("account {account} not found"),
            ));
        };
        if desc.buckets.iter().any(|b| b == bucket) {
            return Err(recoverable(
                ErrorCode::AlreadyExists,
                format!("bucket {bucket} already exists"),
            ));
        }
        let now = now_ns();
        let bucket_desc = BucketDescriptor {
            owner,
            size: 0,
            key_count: 0,
            created_ns: now,
            last_updated_ns: now,
        };
        desc.buckets.push(bucket.to_string());
        desc.bucket_count = desc.buckets.len() as u64;
        desc.last_updated_ns = now;

        let acct = account_bucket(account);
        let ops = vec![
            BatchOp::CreateBucket { bucket: data_bucket(account, bucket) },
            BatchOp::put(&acct, &bucket_descriptor_key(bucket), encode(&bucket_desc)?),
            BatchOp::put(&acct, DESCRIPTOR_KEY, encode(&desc)?),
        ];
        Ok((KvPayload::CreateBucketReply { bucket: bucket_desc }, ops))
    }

    fn delete_bucket(&self, account: AccountId, bucket: &str) -> Result<Applied, Failure> {
        let Some(mut desc) = self.account(account)? else {
            return Ok((KvPayload::DeleteBucketReply { ok: false }, Vec::new()));
        };
        let before = desc.buckets.len();
        desc.buckets.retain(|b| b != bucket);
        if desc.buckets.len() == before {
            return Ok((KvPayload::DeleteBucketReply { ok: false }, Vec::new()));
        }
        desc.bucket_count = desc.buckets.len() as u64;
        desc.last_updated_ns = now_ns();

        let acct = account_bucket(account);
        let ops = vec![
            BatchOp::DeleteBucket { bucket: data_bucket(account, bucket) },
            BatchOp::delete(&acct, &bucket_descriptor_key(bucket)),
            BatchOp::put(&acct, DESCRIPTOR_KEY, encode(&desc)?),
        ];
        Ok((KvPayload::DeleteBucketReply { ok: true }, ops))
    }

    fn put_key(
        &self,
        index: u64,
        account: AccountId,
        bucket: &str,
        kv: KeyValue,
    ) -> Result<Applied, Failure> {
        if kv.key.is_empty() {
            return Err(recoverable(ErrorCode::Aborted, "key must not be empty"));
        }
        let mut bucket_desc = self.require_bucket(account, bucket)?;
        let existing = self.key(account, bucket, &kv.key)?;

        let stored = KeyValue {
            create_revision: existing.as_ref().map(|e| e.create_revision).unwrap_or(index),
            mod_revision: index,
            version: existing.as_ref().map(|e| e.version).unwrap_or(0) + 1,
            ..kv
        };
        match &existing {
            Some(old) => {
                bucket_desc.size = bucket_desc.size.saturating_sub(old.value.len() as u64);
            }
            None => bucket_desc.key_count += 1,
        }
        bucket_desc.size += stored.value.len() as u64;
        bucket_desc.last_updated_ns = now_ns();

        let ops = vec![
            BatchOp::put(&data_bucket(account, bucket), &stored.key, encode(&stored)?),
            BatchOp::put(
                &account_bucket(account),
                &bucket_descriptor_key(bucket),
                encode(&bucket_desc)?,
            ),
        ];
        Ok((KvPayload::PutKeyReply { kv: stored }, ops))
    }

    fn delete_key(&self, account: AccountId, bucket: &str, key: &[u8]) -> Result<Applied, Failure> {
        let not_found = || -> Result<Applied, Failure> {
            Ok((KvPayload::DeleteKeyReply { ok: false }, Vec::new()))
        };
        if key.is_empty() || self.account(account)?.is_none() {
            return not_found();
        }
        let Some(mut bucket_desc) = self.bucket(account, bucket)? else {
            return not_found();
        };
        let Some(existing) = self.key(account, bucket, key)? else {
            return not_found();
        };
        bucket_desc.key_count = bucket_desc.key_count.saturating_sub(1);
        bucket_desc.size = bucket_desc.size.saturating_sub(existing.value.len() as u64);
        bucket_desc.last_updated_ns = now_ns();

        let ops = vec![
            BatchOp::delete(&data_bucket(account, bucket), key),
            BatchOp::put(
                &account_bucket(account),
                &bucket_descriptor_key(bucket),
                encode(&bucket_desc)?,
            ),
        ];
        Ok((KvPayload::DeleteKeyReply { ok: true }, ops))
    }

    fn require_bucket(&self, account: AccountId, bucket: &str) -> Result<BucketDescriptor, Failure> {
        if self.account(account)?.is_none() {
            return Err(recoverable(
                ErrorCode::AccountNotFound,
                format!("account {account} not found"),
            ));
        }
        self.bucket(account, bucket)?.ok_or_else(|| {
            recoverable(ErrorCode::BucketNotFound, format!("bucket {bucket} not found"))
        })
    }

    fn get_key(&self, account: AccountId, bucket: &str, key: &[u8]) -> Result<KvPayload, Failure> {
        self.require_bucket(account, bucket)?;
        match self.key(account, bucket, key)? {
            Some(kv) => Ok(KvPayload::GetKeyReply { kv }),
            None => Err(recoverable(ErrorCode::KeyNotFound, "key not found")),
        }
    }
}

fn reply(account: AccountId, bucket: String, res: Result<KvPayload, Failure>) -> Result<Vec<u8>, TessError> {
    let payload = match res {
        Ok(payload) => payload,
        Err(Failure::Recoverable(msg)) => KvPayload::RecoverableError(msg),
        Err(Failure::Fatal(e)) => return Err(e),
    };
    KvEnvelope { account, bucket, payload }.encode()
}

impl StateMachine for KvStateMachine {
    fn update(&mut self, index: u64, cmd: &[u8]) -> Result<Vec<u8>, TessError> {
        let env = KvEnvelope::decode(cmd)?;
        let (account, bucket) = (env.account, env.bucket.clone());
        let kind = env.payload.kind();

        let (res, mut ops) = match self.apply(index, env) {
            Ok((payload, ops)) => (Ok(payload), ops),
            Err(Failure::Fatal(e)) => return Err(e),
            Err(failure) => (Err(failure), Vec::new()),
        };
        ops.push(BatchOp::put(MONOTONIC_BUCKET, INDEX_KEY, index.to_be_bytes().to_vec()));
        self.store.apply_batch(ops)?;

        tracing::trace!(index, account, kind, "kv entry applied");
        reply(account, bucket, res)
    }

    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>, TessError> {
        let env = KvEnvelope::decode(query)?;
        let res = match &env.payload {
            KvPayload::GetKeyRequest { key } => self.get_key(env.account, &env.bucket, key),
            other => Err(recoverable(
                ErrorCode::Aborted,
                format!("{} is not a valid query", other.kind()),
            )),
        };
        reply(env.account, env.bucket, res)
    }

    fn last_applied(&self) -> Result<u64, TessError> {
        match self.store.get(MONOTONIC_BUCKET, INDEX_KEY)? {
            Some(b) => {
                let arr: [u8; 8] = b
                    .as_slice()
                    .try_into()
                    .map_err(|_| TessError::Storage("short index value".into()))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    fn save_snapshot(&self) -> Result<Vec<u8>, TessError> {
        encode(&self.store.export()?)
    }

    fn recover_from_snapshot(&mut self, snapshot: &[u8]) -> Result<(), TessError> {
        let dump: BucketDump = decode(snapshot)?;
        self.store.import(dump)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
