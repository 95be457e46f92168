use finadvisor_core::RequestId;

/// Request context attached by the request-id middleware.
///
/// Present on every request that went through [`crate::app::build_app`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: RequestId,
}

impl RequestContext {
    pub fn new(request_id: RequestId) -> Self {
        Self { request_id }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}
