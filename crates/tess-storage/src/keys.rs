use tess_types::TessError;

/// `data` keyspace: `bucket_utf8 ++ \x00 ++ key`
///
/// Bucket names may not contain a null byte, so a prefix scan for
/// "foo\x00" never returns entries of bucket "foobar".
pub fn bucket_key(bucket: &str, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bucket.len() + 1 + key.len());
    buf.extend_from_slice(bucket.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(key);
    buf
}

/// Prefix covering every key of `bucket`.
pub fn bucket_prefix(bucket: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bucket.len() + 1);
    buf.extend_from_slice(bucket.as_bytes());
    buf.push(0x00);
    buf
}

/// Strips the bucket prefix from a `data` key.
pub fn user_key<'a>(bucket: &str, raw: &'a [u8]) -> &'a [u8] {
    &raw[bucket.len() + 1..]
}

pub fn validate_bucket(bucket: &str) -> Result<(), TessError> {
    if bucket.is_empty() {
        return Err(TessError::InvalidArgument("bucket name must not be empty".into()));
    }
    if bucket.as_bytes().contains(&0x00) {
        return Err(TessError::InvalidArgument("bucket name must not contain NUL".into()));
    }
    Ok(())
}

pub fn validate_key(key: &[u8]) -> Result<(), TessError> {
    if key.is_empty() {
        return Err(TessError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}
