//! Core traits for the relay dispatch engine.
//!
//! # Overview
//!
//! Relay separates **what is asked** from **who answers**:
//! - [`Request`] = a value expecting exactly one handler and one response
//! - [`Notification`] = a value fanned out to zero or more handlers
//! - [`StreamRequest`] = a request whose response is a lazy sequence
//!
//! The declared response type travels with the request itself: `Request`
//! carries an associated `Response` type, `StreamRequest` an associated
//! `Item` type. The dispatcher resolves handlers by the concrete runtime
//! type of the value (`TypeId`), never by inheritance or supertype.
//!
//! # Identity
//!
//! Each in-flight request can be assigned a [`RequestId`], a short opaque
//! identifier used by the causality stage to link nested dispatches into a
//! parent/child tree within one scope.

use std::fmt;

use uuid::Uuid;

/// A request expecting exactly one handler and one typed response.
///
/// The associated `Response` type is the compile-time form of the "declared
/// response type" that the dispatcher needs at runtime: dispatch is keyed by
/// the request's `TypeId`, and the pipeline built for that key is typed over
/// `(Self, Self::Response)`.
///
/// `Clone` is required so the engine can retain the original request for
/// post-processors and exception handlers while behaviors pass an owned
/// value down the pipeline (and may transform it along the way).
///
/// # Void responses
///
/// A request that conceptually returns nothing declares `type Response = ()`
/// and its handler returns `Ok(())` explicitly. This keeps the pipeline
/// contract uniformly response-typed.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct Ping {
///     message: String,
/// }
///
/// impl Request for Ping {
///     type Response = Pong;
/// }
/// ```
pub trait Request: Clone + Send + Sync + 'static {
    /// The response type this request resolves to.
    type Response: Send + 'static;
}

/// A value fanned out to zero or more notification handlers.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Send + Sync + 'static`. You don't need to implement it manually.
///
/// Publishing a notification with no registered handlers succeeds and has
/// no side effects. Delivery goes to handlers registered for the **exact**
/// runtime type only.
pub trait Notification: Send + Sync + 'static {}

// Blanket implementation for any type that meets the requirements
impl<T: Send + Sync + 'static> Notification for T {}

/// A request whose response is a lazy sequence of items.
///
/// The sequence is driven by iteration: nothing runs until the caller polls,
/// and cancellation flowing into iteration cancels the handler and every
/// wrapping stream behavior.
pub trait StreamRequest: Send + Sync + 'static {
    /// The element type of the produced sequence.
    type Item: Send + 'static;
}

/// Short opaque identifier for one in-flight request.
///
/// Generated per dispatch by the causality stage (or adopted from the
/// `request_id` baggage value when the caller supplied one). Treated as an
/// opaque string: equality and ordering are all the engine relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh short id.
    pub fn new() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..8].to_string())
    }

    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        message: String,
    }

    impl Request for Ping {
        type Response = String;
    }

    #[derive(Debug, Clone)]
    struct Tick;

    impl StreamRequest for Tick {
        type Item = u64;
    }

    #[test]
    fn test_request_declares_response_type() {
        fn response_of<R: Request>(_r: &R) -> &'static str {
            std::any::type_name::<R::Response>()
        }
        let ping = Ping {
            message: "hi".into(),
        };
        assert!(response_of(&ping).contains("String"));
    }

    #[test]
    fn test_notification_blanket_impl() {
        fn assert_notification<N: Notification>(_n: &N) {}
        // Any plain value qualifies; registration decides who listens.
        assert_notification(&Ping {
            message: "hi".into(),
        });
        assert_notification(&42u32);
    }

    #[test]
    fn test_stream_request_declares_item() {
        fn item_of<R: StreamRequest>(_r: &R) -> &'static str {
            std::any::type_name::<R::Item>()
        }
        assert_eq!(item_of(&Tick), "u64");
    }

    #[test]
    fn test_request_id_is_short_and_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_id_from_str_roundtrip() {
        let id = RequestId::from("abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.clone().into_inner(), "abc123");
    }

    #[test]
    fn test_request_id_hash_and_ord() {
        use std::collections::HashSet;

        let a = RequestId::from("aaaa");
        let b = RequestId::from("bbbb");
        assert!(a < b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b);
        set.insert(a);
        assert_eq!(set.len(), 2);
    }
}
