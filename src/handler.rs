use crate::connection::Connection;

/// The capability set a concrete protocol implements on top of a
/// [`Connection`]. One `Handler` value lives inside each connection for its
/// entire lifetime, so dispatch from the handler's own methods into its
/// state is a direct, monomorphized call — only the registry lookup that
/// finds *which* connection owns a ready fd goes through a vtable.
///
/// `on_readable` has no default: a connection that never reads is unusual
/// enough that forcing the implementer to say so explicitly is worth the
/// boilerplate. `on_error`/`on_hangup` do have defaults, but they panic —
/// matching the source's "fail loudly" contract for an unoverridden
/// callback, since reaching one without handling it is a programming
/// mistake, not a recoverable I/O condition.
pub trait Handler: Sized {
    fn on_readable(conn: &mut Connection<Self>);

    /// Default: flush the write queue (`conn.write(None)`) and let the
    /// queue-draining itself clear writable interest once empty.
    fn on_writable(conn: &mut Connection<Self>) {
        let _ = conn.write(None);
    }

    fn on_error(conn: &mut Connection<Self>) {
        panic!("on_error not implemented for fd {}", conn.fd());
    }

    fn on_hangup(conn: &mut Connection<Self>) {
        panic!("on_hangup not implemented for fd {}", conn.fd());
    }
}
