//! The middleware contract and chain engine (spec §4.1).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{ExecutionContext, StreamChunk};
use crate::error::Result;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Every middleware implements two hooks: `process` runs the standard onion
/// around the rest of the chain, `stream_chunk` is invoked once per
/// provider-emitted chunk. A middleware that does not participate in
/// streaming inherits the default no-op `stream_chunk`.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// MUST call `next.run(ctx)` exactly once unless this middleware fails
    /// before any side-effect a downstream middleware needs to observe.
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()>;

    /// May mutate `chunk` in place, record state, or call
    /// `ctx.interrupt_stream` to suppress further emission. Returning `Err`
    /// also halts emission, with the same effect as an explicit interrupt.
    async fn stream_chunk(&self, _ctx: &ExecutionContext, chunk: StreamChunk) -> Result<StreamChunk> {
        Ok(chunk)
    }

    /// Identifies this middleware in traces and debug snapshots.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The continuation passed to `Middleware::process`.
///
/// Rather than a boxed `FnOnce(&mut ExecutionContext) -> BoxFuture<...>`
/// (awkward to express soundly over a borrowed `&mut ExecutionContext` in
/// safe Rust without tying two independent lifetimes together), `Next` is a
/// cursor into the owning [`Chain`]'s middleware list — the same
/// `Arc<dyn Trait>`-registry idiom [`crate::tool::ToolRegistry`] uses for its
/// heterogeneous, dynamically-assembled collection, just threaded through an
/// index instead of a closure.
pub struct Next<'a> {
    chain: &'a Chain,
    index: usize,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut ExecutionContext) -> Result<()> {
        self.chain.dispatch(self.index, ctx).await
    }

    /// Hand a provider-emitted chunk to the whole chain's `stream_chunk`
    /// hooks, in forward order from the start of the chain (spec §4.1,
    /// "Emit"). Exposed on `Next` rather than `Chain` directly so streaming
    /// middlewares only ever see the chain through the same handle they
    /// already hold.
    pub async fn emit(&self, ctx: &ExecutionContext, chunk: StreamChunk) -> bool {
        self.chain.emit(ctx, chunk).await
    }
}

/// An ordered chain of middlewares, dispatched as an onion.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Invoke `process` on the head middleware, entering the onion.
    pub async fn process(&self, ctx: &mut ExecutionContext) -> Result<()> {
        self.dispatch(0, ctx).await
    }

    fn dispatch<'a>(&'a self, index: usize, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if index >= self.middlewares.len() {
                return Ok(());
            }
            let mw = self.middlewares[index].clone();
            let next = Next {
                chain: self,
                index: index + 1,
            };
            tracing::debug!(middleware = %mw.name(), index, "dispatching middleware");
            mw.process(ctx, next).await
        })
    }

    /// Walk the chain in forward order invoking `stream_chunk`, halting as
    /// soon as the stream is interrupted (by error or explicit latch), then
    /// forward the possibly-mutated chunk to `ctx.stream_output`. Returns
    /// whether the provider should keep streaming.
    pub async fn emit(&self, ctx: &ExecutionContext, initial: StreamChunk) -> bool {
        let mut chunk = initial;
        for mw in &self.middlewares {
            match mw.stream_chunk(ctx, chunk.clone()).await {
                Ok(mutated) => chunk = mutated,
                Err(err) => {
                    tracing::warn!(middleware = %mw.name(), error = %err, "stream_chunk halted emission");
                    ctx.interrupt_stream(err.to_string());
                    return false;
                }
            }
            if ctx.is_stream_interrupted() {
                break;
            }
        }

        if !ctx.is_stream_interrupted() {
            if let Some(output) = &ctx.stream_output {
                if output.send(chunk).await.is_err() {
                    tracing::debug!("stream output receiver dropped");
                }
            }
        }

        !ctx.is_stream_interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        label: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Counting {
        async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
            self.order.lock().unwrap().push(self.label);
            next.run(ctx).await?;
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    #[tokio::test]
    async fn onion_runs_pre_and_post_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            Arc::new(Counting { label: "a", order: order.clone() }),
            Arc::new(Counting { label: "b", order: order.clone() }),
        ]);
        let mut ctx = ExecutionContext::new();
        chain.process(&mut ctx).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "b", "a"]);
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Middleware for Counter {
        async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
            next.run(ctx).await
        }

        async fn stream_chunk(&self, _ctx: &ExecutionContext, chunk: StreamChunk) -> Result<StreamChunk> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(chunk)
        }
    }

    #[tokio::test]
    async fn emit_walks_all_middlewares_and_forwards() {
        let count = Arc::new(AtomicUsize::new(0));
        let chain = Chain::new(vec![Arc::new(Counter(count.clone())), Arc::new(Counter(count.clone()))]);
        let mut ctx = ExecutionContext::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        ctx.stream_output = Some(tx);

        let keep_going = chain.emit(&ctx, StreamChunk::default()).await;
        assert!(keep_going);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(rx.recv().await.is_some());
    }

    struct Interrupting;

    #[async_trait]
    impl Middleware for Interrupting {
        async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
            next.run(ctx).await
        }

        async fn stream_chunk(&self, ctx: &ExecutionContext, chunk: StreamChunk) -> Result<StreamChunk> {
            ctx.interrupt_stream("nope");
            Ok(chunk)
        }
    }

    #[tokio::test]
    async fn emit_halts_on_interrupt_and_does_not_forward() {
        let chain = Chain::new(vec![Arc::new(Interrupting)]);
        let mut ctx = ExecutionContext::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        ctx.stream_output = Some(tx);

        let keep_going = chain.emit(&ctx, StreamChunk::default()).await;
        assert!(!keep_going);
        assert!(rx.try_recv().is_err());
    }
}
