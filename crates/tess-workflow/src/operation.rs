use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tess_types::TessError;

/// Request options handed to every operation: header and query values.
pub type Options = BTreeMap<String, Vec<String>>;

pub type Modifier = Arc<dyn Fn(&[u8], &Options) -> Result<Vec<u8>, TessError> + Send + Sync>;

/// May swallow an operation error by returning a replacement payload.
pub type FailureHandler = Arc<dyn Fn(TessError) -> Result<Vec<u8>, TessError> + Send + Sync>;

/// One step of a node: transforms the node's data.
#[derive(Clone)]
pub struct Operation {
    id: String,
    modifier: Modifier,
    failure_handler: Option<FailureHandler>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("failure_handler", &self.failure_handler.is_some())
            .finish()
    }
}

impl Operation {
    pub fn new<F>(id: impl Into<String>, modifier: F) -> Self
    where
        F: Fn(&[u8], &Options) -> Result<Vec<u8>, TessError> + Send + Sync + 'static,
    {
        Operation { id: id.into(), modifier: Arc::new(modifier), failure_handler: None }
    }

    /// Passes its input through unchanged.
    pub fn noop(id: impl Into<String>) -> Self {
        Operation::new(id, |data, _| Ok(data.to_vec()))
    }

    pub fn with_failure_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(TessError) -> Result<Vec<u8>, TessError> + Send + Sync + 'static,
    {
        self.failure_handler = Some(Arc::new(handler));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn execute(&self, data: &[u8], options: &Options) -> Result<Vec<u8>, TessError> {
        match (self.modifier)(data, options) {
            Ok(out) => Ok(out),
            Err(e) => {
                let err = TessError::Operation(format!(
                    "function({}), error: function execution failed, {e}",
                    self.id
                ));
                match &self.failure_handler {
                    Some(handler) => handler(err),
                    None => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> Operation {
        Operation::new("explode", |_, _| Err(TessError::Recoverable("boom".into())))
    }

    #[test]
    fn errors_name_the_operation() {
        let err = failing().execute(b"x", &Options::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "function(explode), error: function execution failed, boom"
        );
    }

    #[test]
    fn failure_handler_can_swallow() {
        let op = failing().with_failure_handler(|_| Ok(b"fallback".to_vec()));
        assert_eq!(op.execute(b"x", &Options::new()).unwrap(), b"fallback");

        let op = failing().with_failure_handler(|e| Err(TessError::Recoverable(format!("rewritten: {e}"))));
        assert!(op.execute(b"x", &Options::new()).unwrap_err().to_string().starts_with("rewritten"));
    }

    #[test]
    fn options_reach_the_modifier() {
        let op = Operation::new("greet", |data, opts| {
            let name = opts.get("name").and_then(|v| v.first()).cloned().unwrap_or_default();
            Ok([data, name.as_bytes()].concat())
        });
        let opts = Options::from([("name".to_string(), vec!["ada".to_string()])]);
        assert_eq!(op.execute(b"hi ", &opts).unwrap(), b"hi ada");
    }
}
