use tess_types::{AccountDescriptor, AccountId, BucketDescriptor, KeyValue, Transaction};

// Every request may name an open transaction. Responses echo the updated
// descriptor for transactional calls and `Transaction::default()` otherwise.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateAccountRequest {
    pub account: AccountId,
    pub owner: String,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountResponse {
    pub account: AccountDescriptor,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteAccountRequest {
    pub account: AccountId,
    pub owner: String,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAccountResponse {
    pub ok: bool,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateBucketRequest {
    pub account: AccountId,
    pub owner: String,
    pub name: String,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBucketResponse {
    pub bucket: BucketDescriptor,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBucketRequest {
    pub account: AccountId,
    pub name: String,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBucketResponse {
    pub ok: bool,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetKeyRequest {
    pub account: AccountId,
    pub bucket: String,
    pub key: Vec<u8>,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetKeyResponse {
    pub kv: KeyValue,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutKeyRequest {
    pub account: AccountId,
    pub bucket: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: u64,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutKeyResponse {
    pub kv: KeyValue,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteKeyRequest {
    pub account: AccountId,
    pub bucket: String,
    pub key: Vec<u8>,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteKeyResponse {
    pub ok: bool,
    pub transaction: Transaction,
}
