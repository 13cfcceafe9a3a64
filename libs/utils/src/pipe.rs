//! Channel plumbing between the two actors of this node and the
//! dispatcher that routes their messages.
//!
//! A [`Pipe`] is a pair of unbounded channels with the two directions
//! fixed at construction time, so an actor end and a dispatcher end
//! cannot be crossed. The consensus driver additionally serializes all
//! of its input sources (peer messages, its own published messages,
//! timer fires) into one internal queue; [`forward`] is the pump that
//! feeds one source into such a queue.
use std::future::Future;
use zksync_concurrency::ctx::{self, channel, Ctx};

/// The actor-side end: receives inputs, sends outputs.
pub type ActorPipe<In, Out> = Pipe<In, Out>;

/// The dispatcher-side end: receives the actor's outputs, sends inputs.
pub type DispatcherPipe<In, Out> = Pipe<Out, In>;

/// One end of a bi-directional unbounded channel.
#[derive(Debug)]
pub struct Pipe<In, Out> {
    /// Inbound half.
    pub recv: channel::UnboundedReceiver<In>,
    /// Outbound half.
    pub send: channel::UnboundedSender<Out>,
}

impl<In, Out> Pipe<In, Out> {
    /// Sends a message into the pipe.
    pub fn send(&self, msg: Out) {
        self.send.send(msg)
    }

    /// Awaits the next message from the pipe.
    pub fn recv<'a>(
        &'a mut self,
        ctx: &'a Ctx,
    ) -> ctx::CtxAware<impl 'a + Future<Output = ctx::OrCanceled<In>>> {
        self.recv.recv(ctx)
    }

    /// Pops a message iff one is already queued.
    pub fn try_recv(&mut self) -> Option<In> {
        self.recv.try_recv()
    }

    /// Splits the pipe into its two halves. Used by actors that hand the
    /// inbound half to a pump task while keeping the outbound half for
    /// themselves.
    pub fn split(
        self,
    ) -> (
        channel::UnboundedReceiver<In>,
        channel::UnboundedSender<Out>,
    ) {
        (self.recv, self.send)
    }
}

/// Creates a connected pair of pipe ends.
pub fn new<In, Out>() -> (ActorPipe<In, Out>, DispatcherPipe<In, Out>) {
    let (in_send, in_recv) = channel::unbounded();
    let (out_send, out_recv) = channel::unbounded();
    (
        Pipe {
            recv: in_recv,
            send: out_send,
        },
        Pipe {
            recv: out_recv,
            send: in_send,
        },
    )
}

/// Pumps every message arriving on `recv` into `send`, mapped through
/// `f`. Runs until the context is canceled; the mapped channel outliving
/// the source is not an error.
pub async fn forward<In, Out>(
    ctx: &Ctx,
    mut recv: channel::UnboundedReceiver<In>,
    send: channel::UnboundedSender<Out>,
    f: impl Fn(In) -> Out,
) -> ctx::OrCanceled<()> {
    loop {
        let msg = recv.recv(ctx).await?;
        send.send(f(msg));
    }
}
