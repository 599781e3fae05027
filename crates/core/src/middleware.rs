//! Generic onion-style middleware composition.
//!
//! A [`Handler`] turns a context into a result. A [`Middleware`] receives the
//! context together with [`Next`], the rest of the chain, and decides what to
//! do with it:
//!
//! - pass through: `next.run(ctx).await`
//! - rewrite the context first, then delegate
//! - transform whatever `next` returned (including wrapping a stream)
//! - short-circuit: return a result without calling `next` at all
//!
//! The first middleware registered is the outermost layer: it sees the context
//! before anyone else and the result after everyone else. The last registered
//! middleware wraps the terminal handler directly.
//!
//! # Streaming results
//!
//! When `R` is a lazy stream (the generation pipeline), a middleware that
//! obtains the inner stream owns it. It must either drive it to completion or
//! drop it; dropping is how cancellation reaches the provider. It must never
//! park an inner stream somewhere it will not be polled again.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// The innermost callable of a chain (or a whole chain, see [`Chain`]).
#[async_trait]
pub trait Handler<C, R>: Send + Sync {
    async fn call(&self, ctx: C) -> R;
}

/// One layer of a chain.
#[async_trait]
pub trait Middleware<C, R>: Send + Sync {
    async fn handle(&self, ctx: C, next: Next<'_, C, R>) -> R;
}

/// The remainder of a chain, as seen from inside a middleware.
///
/// Cloning is cheap, so a middleware may delegate more than once (retries).
pub struct Next<'a, C, R> {
    middlewares: &'a [Arc<dyn Middleware<C, R>>],
    terminal: &'a dyn Handler<C, R>,
}

impl<C, R> Clone for Next<'_, C, R> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares,
            terminal: self.terminal,
        }
    }
}

impl<'a, C, R> Next<'a, C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    /// Delegate to the next layer.
    pub async fn run(self, ctx: C) -> R {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                current
                    .handle(
                        ctx,
                        Next {
                            middlewares: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => self.terminal.call(ctx).await,
        }
    }

    /// Number of middleware layers still ahead (not counting the terminal).
    pub fn remaining(&self) -> usize {
        self.middlewares.len()
    }
}

/// A middleware backed by a closure. See [`MiddlewareStack::push_fn`].
pub struct FnMiddleware<F>(F);

#[async_trait]
impl<C, R, F> Middleware<C, R> for FnMiddleware<F>
where
    C: Send + 'static,
    R: Send + 'static,
    F: for<'a> Fn(C, Next<'a, C, R>) -> BoxFuture<'a, R> + Send + Sync,
{
    async fn handle(&self, ctx: C, next: Next<'_, C, R>) -> R {
        (self.0)(ctx, next).await
    }
}

/// Wrap a closure as a middleware.
pub fn from_fn<C, R, F>(f: F) -> FnMiddleware<F>
where
    C: Send + 'static,
    R: Send + 'static,
    F: for<'a> Fn(C, Next<'a, C, R>) -> BoxFuture<'a, R> + Send + Sync,
{
    FnMiddleware(f)
}

/// A terminal handler wrapped by an ordered list of middleware.
pub struct Chain<C, R> {
    middlewares: Arc<[Arc<dyn Middleware<C, R>>]>,
    terminal: Arc<dyn Handler<C, R>>,
}

impl<C, R> Clone for Chain<C, R> {
    fn clone(&self) -> Self {
        Self {
            middlewares: Arc::clone(&self.middlewares),
            terminal: Arc::clone(&self.terminal),
        }
    }
}

impl<C, R> Chain<C, R> {
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[async_trait]
impl<C, R> Handler<C, R> for Chain<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    async fn call(&self, ctx: C) -> R {
        Next {
            middlewares: &self.middlewares,
            terminal: self.terminal.as_ref(),
        }
        .run(ctx)
        .await
    }
}

/// Compose `middlewares` (outermost first) around `terminal`.
pub fn compose<C, R>(
    middlewares: Vec<Arc<dyn Middleware<C, R>>>,
    terminal: Arc<dyn Handler<C, R>>,
) -> Chain<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    Chain {
        middlewares: middlewares.into(),
        terminal,
    }
}

/// Registration surface for one pipeline. Insertion order is call order.
pub struct MiddlewareStack<C, R> {
    middlewares: Vec<Arc<dyn Middleware<C, R>>>,
}

impl<C, R> Default for MiddlewareStack<C, R> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<C, R> Clone for MiddlewareStack<C, R> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<C, R> MiddlewareStack<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware as the new innermost layer.
    pub fn push<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware<C, R> + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Register an already shared middleware.
    pub fn push_arc(&mut self, middleware: Arc<dyn Middleware<C, R>>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Register a closure middleware.
    ///
    /// ```ignore
    /// stack.push_fn(|ctx, next| async move { next.run(ctx).await }.boxed());
    /// ```
    pub fn push_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(C, Next<'a, C, R>) -> BoxFuture<'a, R> + Send + Sync + 'static,
    {
        self.push(from_fn(f))
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Snapshot the current registrations around `terminal`.
    pub fn build(&self, terminal: Arc<dyn Handler<C, R>>) -> Chain<C, R> {
        compose(self.middlewares.clone(), terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Terminal {
        log: Log,
    }

    #[async_trait]
    impl Handler<Vec<String>, Vec<String>> for Terminal {
        async fn call(&self, mut ctx: Vec<String>) -> Vec<String> {
            self.log.lock().unwrap().push("terminal".into());
            ctx.push("terminal".into());
            ctx
        }
    }

    struct Tag {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Middleware<Vec<String>, Vec<String>> for Tag {
        async fn handle(
            &self,
            mut ctx: Vec<String>,
            next: Next<'_, Vec<String>, Vec<String>>,
        ) -> Vec<String> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            ctx.push(self.name.into());
            let mut out = next.run(ctx).await;
            out.push(format!("/{}", self.name));
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            out
        }
    }

    #[tokio::test]
    async fn onion_ordering() {
        let log: Log = Arc::default();
        let mut stack = MiddlewareStack::new();
        stack.push(Tag { name: "a", log: log.clone() });
        stack.push(Tag { name: "b", log: log.clone() });
        let chain = stack.build(Arc::new(Terminal { log: log.clone() }));

        let out = chain.call(vec![]).await;
        assert_eq!(out, ["a", "b", "terminal", "/b", "/a"]);
        assert_eq!(
            *log.lock().unwrap(),
            ["enter a", "enter b", "terminal", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let log: Log = Arc::default();
        let mut stack: MiddlewareStack<Vec<String>, Vec<String>> = MiddlewareStack::new();
        stack.push_fn(|_ctx: Vec<String>, _next: Next<'_, Vec<String>, Vec<String>>| async { vec!["cached".to_string()] }.boxed());
        stack.push(Tag { name: "inner", log: log.clone() });
        let chain = stack.build(Arc::new(Terminal { log: log.clone() }));

        let out = chain.call(vec![]).await;
        assert_eq!(out, ["cached"]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn next_can_be_run_twice() {
        let log: Log = Arc::default();
        let mut stack: MiddlewareStack<Vec<String>, Vec<String>> = MiddlewareStack::new();
        stack.push_fn(|ctx: Vec<String>, next: Next<'_, Vec<String>, Vec<String>>| {
            async move {
                let first = next.clone().run(ctx.clone()).await;
                let mut second = next.run(ctx).await;
                second.extend(first);
                second
            }
            .boxed()
        });
        let chain = stack.build(Arc::new(Terminal { log: log.clone() }));

        let out = chain.call(vec![]).await;
        assert_eq!(out, ["terminal", "terminal"]);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_stack_calls_terminal() {
        let log: Log = Arc::default();
        let chain = compose(Vec::new(), Arc::new(Terminal { log: log.clone() }));
        assert!(chain.is_empty());
        assert_eq!(chain.call(vec![]).await, ["terminal"]);
    }

    #[tokio::test]
    async fn build_snapshots_registrations() {
        let log: Log = Arc::default();
        let mut stack = MiddlewareStack::new();
        let chain = stack.build(Arc::new(Terminal { log: log.clone() }));
        stack.push(Tag { name: "late", log: log.clone() });

        assert_eq!(chain.len(), 0);
        assert_eq!(chain.call(vec![]).await, ["terminal"]);
    }
}
