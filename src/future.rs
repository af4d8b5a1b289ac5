/*
 * Copyright (C) 2025 Filament Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::channel;
use crate::reactor::{CustomEvented, Reactor, TimerEvented};
use mio::Interest;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::time::Instant;

// biased two-way select. the first future is polled first on every wake

pub enum Select2<O1, O2> {
    R1(O1),
    R2(O2),
}

pub struct Select2Future<F1, F2> {
    f1: F1,
    f2: F2,
}

impl<F1, F2> Future for Select2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    type Output = Select2<F1::Output, F2::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: we never move the fields out of self
        let this = unsafe { self.get_unchecked_mut() };

        let f1 = unsafe { Pin::new_unchecked(&mut this.f1) };

        if let Poll::Ready(v) = f1.poll(cx) {
            return Poll::Ready(Select2::R1(v));
        }

        let f2 = unsafe { Pin::new_unchecked(&mut this.f2) };

        if let Poll::Ready(v) = f2.poll(cx) {
            return Poll::Ready(Select2::R2(v));
        }

        Poll::Pending
    }
}

pub fn select_2<F1, F2>(f1: F1, f2: F2) -> Select2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    Select2Future { f1, f2 }
}

pub enum Select3<O1, O2, O3> {
    R1(O1),
    R2(O2),
    R3(O3),
}

pub struct Select3Future<F1, F2, F3> {
    f1: F1,
    f2: F2,
    f3: F3,
}

impl<F1, F2, F3> Future for Select3Future<F1, F2, F3>
where
    F1: Future,
    F2: Future,
    F3: Future,
{
    type Output = Select3<F1::Output, F2::Output, F3::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: we never move the fields out of self
        let this = unsafe { self.get_unchecked_mut() };

        let f1 = unsafe { Pin::new_unchecked(&mut this.f1) };

        if let Poll::Ready(v) = f1.poll(cx) {
            return Poll::Ready(Select3::R1(v));
        }

        let f2 = unsafe { Pin::new_unchecked(&mut this.f2) };

        if let Poll::Ready(v) = f2.poll(cx) {
            return Poll::Ready(Select3::R2(v));
        }

        let f3 = unsafe { Pin::new_unchecked(&mut this.f3) };

        if let Poll::Ready(v) = f3.poll(cx) {
            return Poll::Ready(Select3::R3(v));
        }

        Poll::Pending
    }
}

pub fn select_3<F1, F2, F3>(f1: F1, f2: F2, f3: F3) -> Select3Future<F1, F2, F3>
where
    F1: Future,
    F2: Future,
    F3: Future,
{
    Select3Future { f1, f2, f3 }
}

// resolves the inner future if present, pends forever if not. useful for
// conditionally arming one arm of a select

pub struct SelectOptionFuture<F> {
    fut: Option<F>,
}

impl<F, O> Future for SelectOptionFuture<F>
where
    F: Future<Output = O>,
{
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: we never move the fields out of self
        let this = unsafe { self.get_unchecked_mut() };

        match &mut this.fut {
            Some(f) => unsafe { Pin::new_unchecked(f) }.poll(cx),
            None => Poll::Pending,
        }
    }
}

pub fn select_option<F, O>(fut: Option<F>) -> SelectOptionFuture<F>
where
    F: Future<Output = O>,
{
    SelectOptionFuture { fut }
}

// completion barrier over a pair of futures. both run concurrently on the
// same task; the join resolves once both have resolved

pub struct Join2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    f1: F1,
    f2: F2,
    o1: Option<F1::Output>,
    o2: Option<F2::Output>,
}

impl<F1, F2> Future for Join2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    type Output = (F1::Output, F2::Output);

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: we never move the fields out of self
        let this = unsafe { self.get_unchecked_mut() };

        if this.o1.is_none() {
            let f1 = unsafe { Pin::new_unchecked(&mut this.f1) };

            if let Poll::Ready(v) = f1.poll(cx) {
                this.o1 = Some(v);
            }
        }

        if this.o2.is_none() {
            let f2 = unsafe { Pin::new_unchecked(&mut this.f2) };

            if let Poll::Ready(v) = f2.poll(cx) {
                this.o2 = Some(v);
            }
        }

        if this.o1.is_some() && this.o2.is_some() {
            Poll::Ready((this.o1.take().unwrap(), this.o2.take().unwrap()))
        } else {
            Poll::Pending
        }
    }
}

pub fn join_2<F1, F2>(f1: F1, f2: F2) -> Join2Future<F1, F2>
where
    F1: Future,
    F2: Future,
{
    Join2Future {
        f1,
        f2,
        o1: None,
        o2: None,
    }
}

// async adapter for the receiving end of a cross-thread channel, registered
// with the current reactor

pub struct AsyncReceiver<T> {
    evented: CustomEvented,
    inner: channel::Receiver<T>,
}

impl<T> AsyncReceiver<T> {
    pub fn new(r: channel::Receiver<T>) -> Self {
        let evented = CustomEvented::new(
            r.get_read_registration(),
            Interest::READABLE,
            &Reactor::current().unwrap(),
        )
        .unwrap();

        // check the queue on the first poll
        evented.registration().set_ready(true);

        Self { evented, inner: r }
    }

    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { r: self }
    }
}

pub struct RecvFuture<'a, T> {
    r: &'a AsyncReceiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, mpsc::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let reg = self.r.evented.registration();

        reg.set_waker(cx.waker(), Interest::READABLE);

        if !reg.is_ready() {
            return Poll::Pending;
        }

        match self.r.inner.try_recv() {
            Ok(v) => Poll::Ready(Ok(v)),
            Err(mpsc::TryRecvError::Empty) => {
                reg.set_ready(false);

                Poll::Pending
            }
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(Err(mpsc::RecvError)),
        }
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        self.r.evented.registration().clear_waker();
    }
}

// deadline timer bound to the current reactor

pub struct Timeout {
    evented: RefCell<Option<TimerEvented>>,
}

impl Timeout {
    pub fn new(deadline: Instant) -> Self {
        let reactor = Reactor::current().unwrap();

        let evented = if deadline > reactor.now() {
            Some(TimerEvented::new(deadline, &reactor).unwrap())
        } else {
            None
        };

        Self {
            evented: RefCell::new(evented),
        }
    }

    pub fn set_deadline(&self, deadline: Instant) {
        let reactor = Reactor::current().unwrap();

        if deadline > reactor.now() {
            if let Some(evented) = self.evented.borrow().as_ref() {
                evented.set_expires(deadline);
                evented.registration().set_ready(false);

                return;
            }

            self.evented
                .replace(Some(TimerEvented::new(deadline, &reactor).unwrap()));
        } else {
            self.evented.replace(None);
        }
    }

    pub fn elapsed(&self) -> TimeoutFuture<'_> {
        TimeoutFuture { t: self }
    }
}

pub struct TimeoutFuture<'a> {
    t: &'a Timeout,
}

impl Future for TimeoutFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let evented = self.t.evented.borrow();

        let Some(evented) = evented.as_ref() else {
            // no registration means the deadline already passed
            return Poll::Ready(());
        };

        if evented.registration().is_ready() {
            return Poll::Ready(());
        }

        evented
            .registration()
            .set_waker(cx.waker(), Interest::READABLE);

        Poll::Pending
    }
}

impl Drop for TimeoutFuture<'_> {
    fn drop(&mut self) {
        if let Some(evented) = self.t.evented.borrow().as_ref() {
            evented.registration().clear_waker();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn select_and_join() {
        let executor = Executor::new(1);

        executor
            .spawn(async {
                match select_2(async { 1 }, std::future::pending::<u32>()).await {
                    Select2::R1(v) => assert_eq!(v, 1),
                    Select2::R2(_) => unreachable!(),
                }

                match select_2(std::future::pending::<u32>(), async { 2 }).await {
                    Select2::R1(_) => unreachable!(),
                    Select2::R2(v) => assert_eq!(v, 2),
                }

                match select_3(
                    std::future::pending::<u32>(),
                    std::future::pending::<u32>(),
                    async { 3 },
                )
                .await
                {
                    Select3::R3(v) => assert_eq!(v, 3),
                    _ => unreachable!(),
                }

                let (a, b) = join_2(async { 1 }, async { "x" }).await;
                assert_eq!(a, 1);
                assert_eq!(b, "x");
            })
            .unwrap();

        executor.run(|_| Ok(())).unwrap();
        assert_eq!(executor.have_tasks(), false);
    }

    #[test]
    fn select_option_none_pends() {
        let executor = Executor::new(1);

        let resolved = Rc::new(Cell::new(false));

        {
            let resolved = resolved.clone();

            executor
                .spawn(async move {
                    let arm: Option<std::future::Ready<u32>> = None;

                    match select_2(async {}, select_option(arm)).await {
                        Select2::R1(_) => {}
                        Select2::R2(_) => unreachable!(),
                    }

                    resolved.set(true);
                })
                .unwrap();
        }

        executor.run(|_| Ok(())).unwrap();
        assert_eq!(resolved.get(), true);
    }

    #[test]
    fn async_receiver() {
        let reactor = Reactor::new(2);
        let executor = Executor::new(1);

        let (sender, receiver) = channel::channel(1);

        executor
            .spawn(async move {
                let receiver = AsyncReceiver::new(receiver);

                assert_eq!(receiver.recv().await.unwrap(), 42);
                assert!(receiver.recv().await.is_err());
            })
            .unwrap();

        let t = thread::spawn(move || {
            sender.send(42).unwrap();
        });

        executor.run(|timeout| reactor.poll(timeout)).unwrap();

        t.join().unwrap();
    }

    #[test]
    fn timeout_elapsed() {
        let reactor = Reactor::new(1);
        let executor = Executor::new(1);

        executor
            .spawn(async {
                let timeout = Timeout::new(
                    Reactor::current().unwrap().now() + Duration::from_millis(20),
                );

                timeout.elapsed().await;
            })
            .unwrap();

        executor.run(|timeout| reactor.poll(timeout)).unwrap();
    }

    #[test]
    fn timeout_already_passed() {
        let reactor = Reactor::new(1);
        let executor = Executor::new(1);

        executor
            .spawn(async {
                let timeout = Timeout::new(Reactor::current().unwrap().now());

                timeout.elapsed().await;
            })
            .unwrap();

        executor.run(|timeout| reactor.poll(timeout)).unwrap();
    }
}
