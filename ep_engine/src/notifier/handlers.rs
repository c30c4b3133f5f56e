use std::collections::VecDeque;

/// Tagged response shape, replacing a polymorphic handler hierarchy: one
/// variant per command family, dispatched from a single point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingHandler {
    DelVbucket,
    Flush,
    SelectBucket,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The server replied to this exact request.
    Response(u16),
    /// The server replied to a later request without replying to this one.
    ImplicitResponse,
    /// The connection was torn down while this request was outstanding.
    ConnectionReset,
}

struct Entry {
    seqno: u32,
    kind: PendingHandler,
}

/// Ordered, strictly-ascending-by-seqno list of outstanding requests. The
/// head is always the oldest unacknowledged one.
#[derive(Default)]
pub struct ResponseHandlerList {
    entries: VecDeque<Entry>,
}

impl ResponseHandlerList {
    pub fn push(&mut self, seqno: u32, kind: PendingHandler) {
        debug_assert!(
            self.entries.back().map_or(true, |e| e.seqno < seqno),
            "handlers must be appended in strictly ascending seqno order"
        );
        self.entries.push_back(Entry { seqno, kind });
    }

    /// Resolves every handler with `seqno < opaque` as an implicit response
    /// (the server chose not to reply to them), then resolves the handler
    /// matching `opaque`, if still pending. Returns resolved entries in the
    /// order they were retired.
    pub fn dispatch(&mut self, opaque: u32, status: u16) -> Vec<(u32, PendingHandler, HandlerOutcome)> {
        let mut resolved = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.seqno < opaque {
                let entry = self.entries.pop_front().unwrap();
                resolved.push((entry.seqno, entry.kind, HandlerOutcome::ImplicitResponse));
            } else {
                break;
            }
        }
        if let Some(front) = self.entries.front() {
            if front.seqno == opaque {
                let entry = self.entries.pop_front().unwrap();
                resolved.push((entry.seqno, entry.kind, HandlerOutcome::Response(status)));
            }
        }
        resolved
    }

    /// Drains every outstanding handler with a synthesized reset outcome —
    /// called before reconnecting so nobody waits forever on a dead socket.
    pub fn drain_on_reset(&mut self) -> Vec<(u32, PendingHandler, HandlerOutcome)> {
        self.entries.drain(..).map(|e| (e.seqno, e.kind, HandlerOutcome::ConnectionReset)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_earlier_handlers_get_implicit_response_once() {
        let mut list = ResponseHandlerList::default();
        list.push(1, PendingHandler::Notify);
        list.push(2, PendingHandler::Notify);
        list.push(3, PendingHandler::Notify);

        let resolved = list.dispatch(2, 0);
        assert_eq!(
            resolved,
            vec![
                (1, PendingHandler::Notify, HandlerOutcome::ImplicitResponse),
                (2, PendingHandler::Notify, HandlerOutcome::Response(0)),
            ]
        );

        let resolved = list.dispatch(3, 0);
        assert_eq!(resolved, vec![(3, PendingHandler::Notify, HandlerOutcome::Response(0))]);
        assert!(list.is_empty());
    }

    #[test]
    fn reset_drains_everything_outstanding() {
        let mut list = ResponseHandlerList::default();
        list.push(1, PendingHandler::Flush);
        list.push(2, PendingHandler::DelVbucket);
        let drained = list.drain_on_reset();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|(_, _, o)| matches!(o, HandlerOutcome::ConnectionReset)));
        assert!(list.is_empty());
    }
}
