//! Command envelope exchanged between the KV façade and the KV state machine.
//!
//! Requests and replies share one tagged union so a single proposal payload
//! carries the target account, the bucket, and exactly one typed operation.

use crate::{AccountDescriptor, AccountId, BucketDescriptor, KeyValue, TessError};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KvEnvelope {
    pub account: AccountId,
    pub bucket: String,
    pub payload: KvPayload,
}

impl KvEnvelope {
    pub fn new(account: AccountId, bucket: impl Into<String>, payload: KvPayload) -> Self {
        KvEnvelope { account, bucket: bucket.into(), payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TessError> {
        crate::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TessError> {
        crate::decode(bytes)
    }

    /// Turns an embedded recoverable error into `Err`, passing every other
    /// payload through.
    pub fn into_result(self) -> Result<KvPayload, TessError> {
        match self.payload {
            KvPayload::RecoverableError(msg) => Err(msg.into_error()),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KvPayload {
    CreateAccountRequest { owner: String },
    CreateAccountReply { account: AccountDescriptor },
    DeleteAccountRequest { owner: String },
    DeleteAccountReply { ok: bool },
    CreateBucketRequest { owner: String },
    CreateBucketReply { bucket: BucketDescriptor },
    DeleteBucketRequest,
    DeleteBucketReply { ok: bool },
    GetKeyRequest { key: Vec<u8> },
    GetKeyReply { kv: KeyValue },
    PutKeyRequest { kv: KeyValue },
    PutKeyReply { kv: KeyValue },
    DeleteKeyRequest { key: Vec<u8> },
    DeleteKeyReply { ok: bool },
    RecoverableError(ErrorMessage),
}

impl KvPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            KvPayload::CreateAccountRequest { .. } => "create_account_request",
            KvPayload::CreateAccountReply { .. } => "create_account_reply",
            KvPayload::DeleteAccountRequest { .. } => "delete_account_request",
            KvPayload::DeleteAccountReply { .. } => "delete_account_reply",
            KvPayload::CreateBucketRequest { .. } => "create_bucket_request",
            KvPayload::CreateBucketReply { .. } => "create_bucket_reply",
            KvPayload::DeleteBucketRequest => "delete_bucket_request",
            KvPayload::DeleteBucketReply { .. } => "delete_bucket_reply",
            KvPayload::GetKeyRequest { .. } => "get_key_request",
            KvPayload::GetKeyReply { .. } => "get_key_reply",
            KvPayload::PutKeyRequest { .. } => "put_key_request",
            KvPayload::PutKeyReply { .. } => "put_key_reply",
            KvPayload::DeleteKeyRequest { .. } => "delete_key_request",
            KvPayload::DeleteKeyReply { .. } => "delete_key_reply",
            KvPayload::RecoverableError(_) => "recoverable_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    Aborted,
    AlreadyExists,
    AccountNotFound,
    BucketNotFound,
    KeyNotFound,
}

/// Application-level failure reported by the state machine inside a reply.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorMessage { code, message: message.into() }
    }

    pub fn into_error(self) -> TessError {
        match self.code {
            ErrorCode::AccountNotFound => TessError::AccountNotFound,
            ErrorCode::BucketNotFound => TessError::BucketNotFound,
            ErrorCode::KeyNotFound => TessError::KeyNotFound,
            ErrorCode::Aborted | ErrorCode::AlreadyExists => TessError::Recoverable(self.message),
        }
    }
}
