//! Point-to-point credit channel, grounded on
//! `examples/original_source/src/snap_dpa_p2p.h`: 64-byte fixed messages
//! over a credit-based RC-QP pair, one credit always held back for a
//! credit-refund message so a throttled side can still unblock its peer.

pub const CREDIT_COUNT: u16 = 64;
pub const MSG_LEN: usize = 64;
/// `(64 - sizeof(msg_base)) / sizeof(u16) - 2`, sizeof(msg_base) == 6
/// bytes (type, rsvd, credit_delta, qid): `(64-6)/2 - 2 = 27`.
pub const VQ_MAX_HEADS: usize = (MSG_LEN - 6) / 2 - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    CrUpdate,
    VqHeads,
    VqTable,
    VqTableCont,
    VqMsix,
    NvmeSqHead,
    NvmeCqTail,
    NvmeMsix,
}

impl MsgType {
    pub fn to_u8(self) -> u8 {
        use MsgType::*;
        match self {
            CrUpdate => 1,
            VqHeads => 20,
            VqTable => 21,
            VqTableCont => 22,
            VqMsix => 30,
            NvmeSqHead => 40,
            NvmeCqTail => 41,
            NvmeMsix => 50,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        use MsgType::*;
        Some(match v {
            1 => CrUpdate,
            20 => VqHeads,
            21 => VqTable,
            22 => VqTableCont,
            30 => VqMsix,
            40 => NvmeSqHead,
            41 => NvmeCqTail,
            50 => NvmeMsix,
            _ => return None,
        })
    }
}

/// `struct snap_dpa_p2p_msg_base` plus the vq-update payload; the other
/// message types carry no extra fields in this crate's scope, so one
/// struct covers the whole 64-byte record.
#[derive(Debug, Clone)]
pub struct P2pMsg {
    pub msg_type: MsgType,
    pub credit_delta: u16,
    pub qid: u16,
    pub avail_index: u16,
    pub descr_heads: Vec<u16>,
}

impl P2pMsg {
    pub fn cr_update(credit_delta: u16) -> Self {
        P2pMsg { msg_type: MsgType::CrUpdate, credit_delta, qid: 0, avail_index: 0, descr_heads: Vec::new() }
    }

    pub fn vq_heads(qid: u16, avail_index: u16, heads: Vec<u16>) -> Self {
        assert!(heads.len() <= VQ_MAX_HEADS, "too many heads for one p2p message");
        P2pMsg { msg_type: MsgType::VqHeads, credit_delta: 0, qid, avail_index, descr_heads: heads }
    }
}

/// Credit-tracked endpoint: each side starts with [`CREDIT_COUNT`] - 1
/// usable credits (one reserved for its own credit-refund message) and
/// refills from `CrUpdate` messages it receives.
pub struct CreditEndpoint {
    local_credits: u16,
    /// Messages received since the last credit update was sent to the
    /// peer, i.e. the `credit_delta` our next `CrUpdate` will report.
    unreported: u16,
}

impl CreditEndpoint {
    pub fn new() -> Self {
        CreditEndpoint { local_credits: CREDIT_COUNT - 1, unreported: 0 }
    }

    pub fn available(&self) -> u16 {
        self.local_credits
    }

    /// Consumes one credit to send `msg`. Fails with `None` (the
    /// original's `-EAGAIN`) rather than panicking: callers are expected
    /// to retry once a credit update arrives.
    pub fn try_send(&mut self, msg: P2pMsg) -> Option<P2pMsg> {
        if self.local_credits == 0 {
            return None;
        }
        self.local_credits -= 1;
        Some(msg)
    }

    /// Records one inbound message and reports whether a credit refund
    /// is now due.
    pub fn on_receive(&mut self) {
        self.unreported += 1;
    }

    /// Drains the unreported count into a `CrUpdate` message, or `None`
    /// if nothing needs reporting.
    pub fn pending_credit_update(&mut self) -> Option<P2pMsg> {
        if self.unreported == 0 {
            return None;
        }
        let delta = self.unreported;
        self.unreported = 0;
        Some(P2pMsg::cr_update(delta))
    }

    /// Applies a received `CrUpdate`, restoring credits up to the
    /// channel's fixed capacity.
    pub fn apply_credit_update(&mut self, delta: u16) {
        self.local_credits = (self.local_credits + delta).min(CREDIT_COUNT - 1);
    }
}

impl Default for CreditEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_refills_credits() {
        let mut ep = CreditEndpoint::new();
        let start = ep.available();
        for _ in 0..start {
            assert!(ep.try_send(P2pMsg::cr_update(0)).is_some());
        }
        assert!(ep.try_send(P2pMsg::cr_update(0)).is_none(), "out of credits");

        ep.apply_credit_update(start);
        assert_eq!(ep.available(), start);
    }

    #[test]
    fn credit_update_drains_unreported_count() {
        let mut ep = CreditEndpoint::new();
        assert!(ep.pending_credit_update().is_none());
        ep.on_receive();
        ep.on_receive();
        ep.on_receive();
        let update = ep.pending_credit_update().unwrap();
        assert_eq!(update.credit_delta, 3);
        assert!(ep.pending_credit_update().is_none());
    }

    #[test]
    fn vq_heads_message_respects_max_heads() {
        let heads: Vec<u16> = (0..VQ_MAX_HEADS as u16).collect();
        let msg = P2pMsg::vq_heads(0, 10, heads.clone());
        assert_eq!(msg.descr_heads, heads);
    }

    #[test]
    #[should_panic]
    fn vq_heads_message_rejects_overflow() {
        let heads: Vec<u16> = (0..(VQ_MAX_HEADS as u16 + 1)).collect();
        P2pMsg::vq_heads(0, 10, heads);
    }
}
