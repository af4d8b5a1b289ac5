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

use crate::http1::Reply;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

// per-connection replies in flight, capped at 10. the reader parks on
// not_full when the writer falls behind, which is what ultimately pushes
// backpressure onto the socket
pub const REPLIES_MAX: usize = 10;

struct Inner {
    items: VecDeque<Option<Reply>>,
    capacity: usize,
    // single producer, single consumer
    producer_waker: Option<Waker>,
    consumer_waker: Option<Waker>,
}

impl Inner {
    fn wake_producer(&mut self) {
        if let Some(waker) = self.producer_waker.take() {
            waker.wake();
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer_waker.take() {
            waker.wake();
        }
    }
}

// FIFO of queued replies. an empty entry is the end-of-stream sentinel: the
// producer pushes it when it finishes and the consumer stops on popping it
pub struct ReplyQueue {
    inner: RefCell<Inner>,
}

impl ReplyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RefCell::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                producer_waker: None,
                consumer_waker: None,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    // resolves once there is room for a push
    pub fn not_full(&self) -> NotFullFuture<'_> {
        NotFullFuture { q: self }
    }

    // immediate push. only valid when there is room, e.g. right after
    // awaiting not_full
    pub fn push(&self, item: Option<Reply>) {
        let inner = &mut *self.inner.borrow_mut();

        assert!(inner.items.len() < inner.capacity);

        inner.items.push_back(item);
        inner.wake_consumer();
    }

    // push that suspends while the queue is full
    pub fn push_eventually(&self, item: Option<Reply>) -> PushFuture<'_> {
        PushFuture {
            q: self,
            item: Some(item),
        }
    }

    // pop that suspends while the queue is empty
    pub fn pop_eventually(&self) -> PopFuture<'_> {
        PopFuture { q: self }
    }
}

pub struct NotFullFuture<'a> {
    q: &'a ReplyQueue,
}

impl Future for NotFullFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let inner = &mut *self.q.inner.borrow_mut();

        if inner.items.len() < inner.capacity {
            Poll::Ready(())
        } else {
            inner.producer_waker = Some(cx.waker().clone());

            Poll::Pending
        }
    }
}

pub struct PushFuture<'a> {
    q: &'a ReplyQueue,
    item: Option<Option<Reply>>,
}

impl Future for PushFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let f = &mut *self;

        let inner = &mut *f.q.inner.borrow_mut();

        if inner.items.len() < inner.capacity {
            inner.items.push_back(f.item.take().unwrap());
            inner.wake_consumer();

            Poll::Ready(())
        } else {
            inner.producer_waker = Some(cx.waker().clone());

            Poll::Pending
        }
    }
}

pub struct PopFuture<'a> {
    q: &'a ReplyQueue,
}

impl Future for PopFuture<'_> {
    type Output = Option<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let inner = &mut *self.q.inner.borrow_mut();

        match inner.items.pop_front() {
            Some(item) => {
                inner.wake_producer();

                Poll::Ready(item)
            }
            None => {
                inner.consumer_waker = Some(cx.waker().clone());

                Poll::Pending
            }
        }
    }
}
