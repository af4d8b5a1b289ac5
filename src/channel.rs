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

use crate::event;
use mio::Interest;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc;
use std::task::{Context, Poll, Waker};

// bounded cross-thread channel. readiness registrations allow either end
// to be polled by a reactor

pub struct Sender<T> {
    sender: Option<mpsc::SyncSender<T>>,
    read_set_readiness: event::SetReadiness,
    write_registration: event::Registration,
}

impl<T> Sender<T> {
    pub fn get_write_registration(&self) -> &event::Registration {
        &self.write_registration
    }

    pub fn try_send(&self, t: T) -> Result<(), mpsc::TrySendError<T>> {
        match self.sender.as_ref().unwrap().try_send(t) {
            Ok(_) => {
                self.read_set_readiness
                    .set_readiness(Interest::READABLE)
                    .unwrap();

                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn send(&self, t: T) -> Result<(), mpsc::SendError<T>> {
        match self.sender.as_ref().unwrap().send(t) {
            Ok(_) => {
                self.read_set_readiness
                    .set_readiness(Interest::READABLE)
                    .unwrap();

                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        mem::drop(self.sender.take().unwrap());

        // wake the receiver so it can observe the disconnect
        self.read_set_readiness
            .set_readiness(Interest::READABLE)
            .unwrap();
    }
}

pub struct Receiver<T> {
    receiver: mpsc::Receiver<T>,
    read_registration: event::Registration,
    write_set_readiness: event::SetReadiness,
}

impl<T> Receiver<T> {
    pub fn get_read_registration(&self) -> &event::Registration {
        &self.read_registration
    }

    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(t) => {
                self.write_set_readiness
                    .set_readiness(Interest::WRITABLE)
                    .unwrap();

                Ok(t)
            }
            Err(e) => Err(e),
        }
    }

    pub fn recv(&self) -> Result<T, mpsc::RecvError> {
        let t = self.receiver.recv()?;

        self.write_set_readiness
            .set_readiness(Interest::WRITABLE)
            .unwrap();

        Ok(t)
    }
}

pub fn channel<T>(bound: usize) -> (Sender<T>, Receiver<T>) {
    assert!(bound > 0);

    let (read_reg, read_sr) = event::Registration::new();
    let (write_reg, write_sr) = event::Registration::new();

    let (s, r) = mpsc::sync_channel::<T>(bound);

    let sender = Sender {
        sender: Some(s),
        read_set_readiness: read_sr,
        write_registration: write_reg,
    };

    let receiver = Receiver {
        receiver: r,
        read_registration: read_reg,
        write_set_readiness: write_sr,
    };

    // channel starts out writable
    receiver
        .write_set_readiness
        .set_readiness(Interest::WRITABLE)
        .unwrap();

    (sender, receiver)
}

// bounded shard-local channel. same-thread only, so peers are woken with
// stored wakers instead of reactor registrations

struct LocalInner<T> {
    queue: VecDeque<T>,
    bound: usize,
    senders: usize,
    receiver_alive: bool,
    recv_waker: Option<Waker>,
    send_wakers: Vec<Waker>,
}

impl<T> LocalInner<T> {
    fn wake_receiver(&mut self) {
        if let Some(waker) = self.recv_waker.take() {
            waker.wake();
        }
    }

    fn wake_senders(&mut self) {
        for waker in self.send_wakers.drain(..) {
            waker.wake();
        }
    }
}

pub struct LocalSender<T> {
    inner: Rc<RefCell<LocalInner<T>>>,
}

impl<T> LocalSender<T> {
    pub fn try_send(&self, t: T) -> Result<(), mpsc::TrySendError<T>> {
        let inner = &mut *self.inner.borrow_mut();

        if !inner.receiver_alive {
            return Err(mpsc::TrySendError::Disconnected(t));
        }

        if inner.queue.len() >= inner.bound {
            return Err(mpsc::TrySendError::Full(t));
        }

        inner.queue.push_back(t);
        inner.wake_receiver();

        Ok(())
    }

    pub fn send(&self, t: T) -> LocalSendFuture<'_, T> {
        LocalSendFuture {
            s: self,
            t: Some(t),
        }
    }
}

impl<T> Clone for LocalSender<T> {
    fn clone(&self) -> Self {
        self.inner.borrow_mut().senders += 1;

        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for LocalSender<T> {
    fn drop(&mut self) {
        let inner = &mut *self.inner.borrow_mut();

        inner.senders -= 1;

        if inner.senders == 0 {
            // wake the receiver so it can observe the disconnect
            inner.wake_receiver();
        }
    }
}

pub struct LocalReceiver<T> {
    inner: Rc<RefCell<LocalInner<T>>>,
}

impl<T> LocalReceiver<T> {
    pub fn try_recv(&self) -> Result<T, mpsc::TryRecvError> {
        let inner = &mut *self.inner.borrow_mut();

        match inner.queue.pop_front() {
            Some(t) => {
                inner.wake_senders();

                Ok(t)
            }
            None => {
                if inner.senders == 0 {
                    Err(mpsc::TryRecvError::Disconnected)
                } else {
                    Err(mpsc::TryRecvError::Empty)
                }
            }
        }
    }

    pub fn recv(&self) -> LocalRecvFuture<'_, T> {
        LocalRecvFuture { r: self }
    }
}

impl<T> Drop for LocalReceiver<T> {
    fn drop(&mut self) {
        let inner = &mut *self.inner.borrow_mut();

        inner.receiver_alive = false;

        // a waker parked by a dropped recv future must not outlive us
        inner.recv_waker = None;

        inner.wake_senders();
    }
}

pub fn local_channel<T>(bound: usize) -> (LocalSender<T>, LocalReceiver<T>) {
    assert!(bound > 0);

    let inner = Rc::new(RefCell::new(LocalInner {
        queue: VecDeque::with_capacity(bound),
        bound,
        senders: 1,
        receiver_alive: true,
        recv_waker: None,
        send_wakers: Vec::new(),
    }));

    (
        LocalSender {
            inner: inner.clone(),
        },
        LocalReceiver { inner },
    )
}

pub struct LocalSendFuture<'a, T> {
    s: &'a LocalSender<T>,
    t: Option<T>,
}

impl<T> Future for LocalSendFuture<'_, T> {
    type Output = Result<(), mpsc::SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = unsafe { self.get_unchecked_mut() };

        let t = f.t.take().unwrap();

        match f.s.try_send(t) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(mpsc::TrySendError::Full(t)) => {
                f.t = Some(t);

                f.s.inner.borrow_mut().send_wakers.push(cx.waker().clone());

                Poll::Pending
            }
            Err(mpsc::TrySendError::Disconnected(t)) => Poll::Ready(Err(mpsc::SendError(t))),
        }
    }
}

pub struct LocalRecvFuture<'a, T> {
    r: &'a LocalReceiver<T>,
}

impl<T> Future for LocalRecvFuture<'_, T> {
    type Output = Result<T, mpsc::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.r.try_recv() {
            Ok(t) => Poll::Ready(Ok(t)),
            Err(mpsc::TryRecvError::Empty) => {
                self.r.inner.borrow_mut().recv_waker = Some(cx.waker().clone());

                Poll::Pending
            }
            Err(mpsc::TryRecvError::Disconnected) => Poll::Ready(Err(mpsc::RecvError)),
        }
    }
}
