use std::{collections::VecDeque, time::Duration};

use tracing::warn;

use crate::{
    error::{Error, Result},
    protocol::packet_hdr::FragmentRole,
};

use super::context::ConnectionContext;

/// In-order reassembly of fragmented messages.
pub struct Reassembly {
    partial: Option<Vec<u8>>,
    ready: VecDeque<Vec<u8>>,
    window: Duration,
}

impl Reassembly {
    #[inline]
    fn check_rep(&self, ctx: &ConnectionContext) {
        if self.partial.is_none() {
            assert_eq!(ctx.last_packet_number, 0);
        }
    }

    #[must_use]
    pub fn new(window: Duration) -> Self {
        Reassembly {
            partial: None,
            ready: VecDeque::new(),
            window,
        }
    }

    /// Accepts one data fragment. A fragment out of sequence is rejected
    /// and the partial message is kept for a correctly numbered retry.
    pub fn push(
        &mut self,
        ctx: &mut ConnectionContext,
        role: FragmentRole,
        msg_num: u32,
        body: &[u8],
    ) -> Result<()> {
        match role {
            FragmentRole::Solo => {
                self.discard_partial(ctx);
                self.ready.push_back(body.to_vec());
            }
            FragmentRole::First => {
                self.discard_partial(ctx);
                ctx.enter_reassembly(self.window);
                self.partial = Some(body.to_vec());
                ctx.last_packet_number = msg_num;
            }
            FragmentRole::Middle | FragmentRole::Last => {
                let expected = ctx.last_packet_number.wrapping_add(1);
                let partial = match self.partial.as_mut() {
                    Some(x) if msg_num == expected => x,
                    _ => {
                        return Err(Error::InvalidMessageNumber {
                            expected,
                            actual: msg_num,
                        })
                    }
                };
                partial.extend_from_slice(body);
                ctx.last_packet_number = msg_num;

                if role == FragmentRole::Last {
                    let msg = self.partial.take().unwrap();
                    self.ready.push_back(msg);
                    ctx.leave_reassembly();
                    ctx.last_packet_number = 0;
                }
            }
        }
        self.check_rep(ctx);
        Ok(())
    }

    fn discard_partial(&mut self, ctx: &mut ConnectionContext) {
        if let Some(partial) = self.partial.take() {
            warn!(
                bytes = partial.len(),
                last = ctx.last_packet_number,
                "dropping incomplete message"
            );
            self.abandon(ctx);
        }
    }

    /// Drops the partial message and restores the saved receive timeout.
    pub fn abandon(&mut self, ctx: &mut ConnectionContext) {
        self.partial = None;
        ctx.leave_reassembly();
        ctx.last_packet_number = 0;
        self.check_rep(ctx);
    }

    #[must_use]
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    #[must_use]
    pub fn partial_len(&self) -> Option<usize> {
        self.partial.as_ref().map(|x| x.len())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        arq::context::{ConnectionContextBuilder, Role},
        transport::TransportKind,
    };

    use super::*;

    const WINDOW: Duration = Duration::from_millis(250);
    const BASE: Duration = Duration::from_secs(3);

    fn context() -> ConnectionContext {
        ConnectionContextBuilder {
            kind: TransportKind::Arq,
            role: Role::Responder,
            peer: None,
            connection_id: 0,
            recv_timeout: Some(BASE),
        }
        .build()
    }

    #[test]
    fn three_fragments() {
        let mut ctx = context();
        let mut buf = Reassembly::new(WINDOW);
        buf.push(&mut ctx, FragmentRole::First, 1, &[1]).unwrap();
        assert_eq!(ctx.recv_timeout(), Some(WINDOW));
        buf.push(&mut ctx, FragmentRole::Middle, 2, &[2]).unwrap();
        assert!(buf.pop().is_none());
        buf.push(&mut ctx, FragmentRole::Last, 3, &[3]).unwrap();
        assert_eq!(buf.pop().unwrap(), vec![1, 2, 3]);
        assert_eq!(ctx.recv_timeout(), Some(BASE));
        assert_eq!(ctx.last_packet_number, 0);
    }

    #[test]
    fn skipped_number_keeps_partial() {
        let mut ctx = context();
        let mut buf = Reassembly::new(WINDOW);
        buf.push(&mut ctx, FragmentRole::First, 1, &[1]).unwrap();
        buf.push(&mut ctx, FragmentRole::Middle, 2, &[2]).unwrap();
        match buf.push(&mut ctx, FragmentRole::Middle, 4, &[4]) {
            Err(Error::InvalidMessageNumber {
                expected: 3,
                actual: 4,
            }) => (),
            other => panic!("{:?}", other),
        }
        assert_eq!(buf.partial_len(), Some(2));
        buf.push(&mut ctx, FragmentRole::Last, 3, &[3]).unwrap();
        assert_eq!(buf.pop().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn middle_without_first() {
        let mut ctx = context();
        let mut buf = Reassembly::new(WINDOW);
        assert!(buf.push(&mut ctx, FragmentRole::Middle, 1, &[1]).is_err());
        assert!(buf.push(&mut ctx, FragmentRole::Last, 1, &[1]).is_err());
        assert!(buf.pop().is_none());
        assert_eq!(ctx.recv_timeout(), Some(BASE));
    }

    #[test]
    fn solo_interrupts_partial() {
        let mut ctx = context();
        let mut buf = Reassembly::new(WINDOW);
        buf.push(&mut ctx, FragmentRole::First, 1, &[1]).unwrap();
        buf.push(&mut ctx, FragmentRole::Solo, 1, &[9]).unwrap();
        assert_eq!(buf.pop().unwrap(), vec![9]);
        assert!(buf.partial_len().is_none());
        assert_eq!(ctx.recv_timeout(), Some(BASE));
    }
}
