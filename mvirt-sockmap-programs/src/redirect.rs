//! Stream parser and verdict programs for sockmap splicing
//!
//! Both programs are attached to SOCKMAP. Every skb received on a socket in
//! the map passes through the verdict program, which looks up the slot of the
//! receiving socket by its cookie and redirects the data out of the socket in
//! the peer slot. If the peer slot is empty the skb is passed to the
//! receiving socket unchanged.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::sk_action,
    helpers::bpf_get_socket_cookie,
    macros::{map, stream_parser, stream_verdict},
    maps::{HashMap, SockMap},
    programs::SkBuffContext,
};
use aya_log_ebpf::debug;

use mvirt_sockmap_programs::{DEFAULT_MAX_ENTRIES, peer_slot};

/// Spliced sockets by slot index
#[map]
static SOCKMAP: SockMap = SockMap::with_max_entries(DEFAULT_MAX_ENTRIES, 0);

/// Socket cookie to slot index
#[map]
static SOCK_INDEX: HashMap<u64, u32> = HashMap::with_max_entries(DEFAULT_MAX_ENTRIES, 0);

#[stream_parser]
pub fn sockmap_parser(ctx: SkBuffContext) -> u32 {
    // No framing: the whole skb is one message.
    ctx.len()
}

#[stream_verdict]
pub fn sockmap_verdict(ctx: SkBuffContext) -> u32 {
    match try_sockmap_verdict(&ctx) {
        Ok(action) => action,
        Err(_) => sk_action::SK_PASS, // On error, deliver locally
    }
}

#[inline(always)]
fn try_sockmap_verdict(ctx: &SkBuffContext) -> Result<u32, ()> {
    let cookie = unsafe { bpf_get_socket_cookie(ctx.skb.skb as *mut _) };

    let index = match unsafe { SOCK_INDEX.get(&cookie) } {
        Some(index) => *index,
        None => return Ok(sk_action::SK_PASS),
    };
    let peer = peer_slot(index);

    // An empty peer slot makes the helper return SK_DROP without setting a
    // redirect target; SK_PASS then delivers to the receiving socket.
    let ret = unsafe { SOCKMAP.redirect_skb(ctx, peer, 0) };
    if ret as u32 != sk_action::SK_PASS {
        debug!(ctx, "slot {}: peer {} empty, passing", index, peer);
    }

    Ok(sk_action::SK_PASS)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
