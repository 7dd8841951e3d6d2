//! MultiCallback: fan one operation out to every enabled service and fold the completions.
//!
//! Ready once every dispatched service has reported. The aggregate succeeds if any
//! service succeeded. There is no timeout here; a service that never reports keeps
//! the aggregate pending.

use std::mem;

use tracing::debug;

use crate::results::ResultCode;
use crate::service::ServiceKind;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceRequest {
    service: ServiceKind,
    code: Option<ResultCode>,
}

#[derive(Debug)]
pub struct MultiCallback<T> {
    name: &'static str,
    result: T,
    requests: Vec<ServiceRequest>,
}

impl<T: Default> MultiCallback<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            result: T::default(),
            requests: Vec::new(),
        }
    }

    /// Reset for a new round of requests.
    pub fn begin(&mut self) {
        self.result = T::default();
        self.requests.clear();
    }

    pub fn add_request(&mut self, service: ServiceKind) {
        self.requests.push(ServiceRequest {
            service,
            code: None,
        });
    }

    /// Record `service`'s completion. False if no request from it is pending.
    pub fn complete(&mut self, service: ServiceKind, code: ResultCode) -> bool {
        match self
            .requests
            .iter_mut()
            .find(|r| r.service == service && r.code.is_none())
        {
            Some(request) => {
                request.code = Some(code);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, service: ServiceKind) -> bool {
        self.requests
            .iter()
            .any(|r| r.service == service && r.code.is_none())
    }

    pub fn is_active(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.is_active() && self.requests.iter().all(|r| r.code.is_some())
    }

    pub fn num_ok(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| r.code == Some(ResultCode::Ok))
            .count()
    }

    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn result(&self) -> &T {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut T {
        &mut self.result
    }

    /// Once ready, hand out the aggregate code and result and reset for reuse.
    pub fn take(&mut self) -> Option<(ResultCode, T)> {
        if !self.is_ready() {
            return None;
        }
        let ok = self.num_ok();
        let total = self.num_requests();
        if ok < total {
            debug!(operation = self.name, failed = total - ok, total, "some services failed");
        }
        let code = if ok > 0 { ResultCode::Ok } else { ResultCode::Error };
        let result = mem::take(&mut self.result);
        self.requests.clear();
        Some((code, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn not_ready_until_all_report() {
        let mut cb: MultiCallback<Vec<u32>> = MultiCallback::new("test");
        assert!(!cb.is_ready());
        cb.begin();
        cb.add_request(ServiceKind::Steam);
        cb.add_request(ServiceKind::Galaxy);
        cb.result_mut().push(1);
        assert!(cb.complete(ServiceKind::Steam, ResultCode::Ok));
        assert!(!cb.is_ready());
        assert!(cb.take().is_none());
        assert!(cb.complete(ServiceKind::Galaxy, ResultCode::Error));
        assert!(cb.is_ready());

        let (code, result) = cb.take().unwrap();
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(result, vec![1]);
        assert!(!cb.is_active());
        assert!(cb.take().is_none());
    }

    #[rstest]
    #[case(&[ResultCode::Ok, ResultCode::Ok], ResultCode::Ok)]
    #[case(&[ResultCode::Ok, ResultCode::Error], ResultCode::Ok)]
    #[case(&[ResultCode::Error, ResultCode::Ok, ResultCode::Error], ResultCode::Ok)]
    #[case(&[ResultCode::Error, ResultCode::Error], ResultCode::Error)]
    fn any_success_wins(#[case] codes: &[ResultCode], #[case] expected: ResultCode) {
        let mut cb: MultiCallback<()> = MultiCallback::new("test");
        let kinds = ServiceKind::ALL;
        for kind in &kinds[..codes.len()] {
            cb.add_request(*kind);
        }
        for (kind, code) in kinds.iter().zip(codes) {
            cb.complete(*kind, *code);
        }
        assert_eq!(cb.take().map(|(c, _)| c), Some(expected));
    }

    #[test]
    fn unexpected_completion_is_rejected() {
        let mut cb: MultiCallback<()> = MultiCallback::new("test");
        cb.add_request(ServiceKind::Steam);
        assert!(!cb.complete(ServiceKind::Enet, ResultCode::Ok));
        assert!(cb.complete(ServiceKind::Steam, ResultCode::Ok));
        assert!(!cb.complete(ServiceKind::Steam, ResultCode::Ok));
        assert!(!cb.is_pending(ServiceKind::Steam));
    }

    #[test]
    fn begin_discards_previous_round() {
        let mut cb: MultiCallback<Vec<u32>> = MultiCallback::new("test");
        cb.add_request(ServiceKind::Steam);
        cb.result_mut().push(7);
        cb.begin();
        assert!(!cb.is_active());
        assert!(cb.result().is_empty());
    }
}
