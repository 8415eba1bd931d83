// SPDX-License-Identifier: MPL-2.0

//! Commands issued to the trusted peer.

use crate::{
    platform::{PeerInvoke, PeerRegs},
    prelude::*,
};

/// The commands understood by the trusted peer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
pub enum PeerCmd {
    /// Announces the channels. Arguments: the descriptor entry of the
    /// announce page, the number of channels.
    ChannelsInit = 1,
    /// Registers shared memory. Argument: the channel holding the header and
    /// the packed descriptor.
    ShmemRegister = 2,
    /// Asks the peer to give a registration back. Argument: the id.
    ShmemRelease = 3,
    /// Announces the event bitmaps. Arguments: the channel holding the
    /// packed descriptor, the capacity of each bitmap.
    EventsInit = 4,
    /// Signals a peer-bound event. Argument: the event id.
    EventNotify = 5,
}

impl PeerCmd {
    /// The first command number available to generic requests.
    pub const GENERIC_BASE: u32 = 0x100;
}

/// Invokes the peer with `cmd` and returns the result registers.
pub(crate) fn call_peer(peer: &dyn PeerInvoke, cmd: u32, args: [u64; 3]) -> Result<[u64; 3]> {
    let mut regs = PeerRegs::new(cmd, args);
    peer.invoke(&mut regs);

    let status = regs.status();
    if status != 0 {
        warn!("peer command {:#x} failed with status {}", cmd, status);
        return_errno_with_message!(ErrorKind::ProtocolFailure, "the peer rejected the command");
    }
    Ok([regs.arg(0), regs.arg(1), regs.arg(2)])
}

pub(crate) fn call(peer: &dyn PeerInvoke, cmd: PeerCmd, args: [u64; 3]) -> Result<[u64; 3]> {
    trace!("peer command {:?}, args {:?}", cmd, args);
    call_peer(peer, cmd as u32, args)
}
