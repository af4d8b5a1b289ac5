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

use crate::list;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EVENTS_MAX: usize = 1024;

pub type Readiness = Option<Interest>;

pub trait ReadinessExt {
    fn merge(&mut self, readiness: Interest);
    fn contains_any(&self, readiness: Interest) -> bool;
}

impl ReadinessExt for Readiness {
    fn merge(&mut self, readiness: Interest) {
        match *self {
            Some(cur) => *self = Some(cur.add(readiness)),
            None => *self = Some(readiness),
        }
    }

    fn contains_any(&self, readiness: Interest) -> bool {
        match *self {
            Some(cur) => {
                (cur.is_readable() && readiness.is_readable())
                    || (cur.is_writable() && readiness.is_writable())
            }
            None => false,
        }
    }
}

struct SourceItem {
    subtoken: Token,
    interests: Interest,
    readiness: Readiness,
}

struct RegisteredSources {
    nodes: Slab<list::Node<SourceItem>>,
    ready: list::List,
}

// user-space readiness sources, settable from any thread. setting readiness
// wakes the poll via a mio waker
struct SyncSources {
    registered: Mutex<RegisteredSources>,
    waker: Waker,
}

impl SyncSources {
    fn new(max_sources: usize, waker: Waker) -> Self {
        Self {
            registered: Mutex::new(RegisteredSources {
                nodes: Slab::with_capacity(max_sources),
                ready: list::List::default(),
            }),
            waker,
        }
    }

    fn register(&self, subtoken: Token, interests: Interest) -> Result<usize, io::Error> {
        let sources = &mut *self.registered.lock().unwrap();

        if sources.nodes.len() == sources.nodes.capacity() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        Ok(sources.nodes.insert(list::Node::new(SourceItem {
            subtoken,
            interests,
            readiness: None,
        })))
    }

    fn deregister(&self, key: usize) {
        let sources = &mut *self.registered.lock().unwrap();

        if sources.nodes.contains(key) {
            sources.ready.remove(&mut sources.nodes, key);
            sources.nodes.remove(key);
        }
    }

    fn set_readiness(&self, key: usize, readiness: Interest) -> Result<(), io::Error> {
        let sources = &mut *self.registered.lock().unwrap();

        if !sources.nodes.contains(key) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }

        let item = &mut sources.nodes[key].value;

        if !(item.interests.is_readable() && readiness.is_readable())
            && !(item.interests.is_writable() && readiness.is_writable())
        {
            // not of interest
            return Ok(());
        }

        let orig = item.readiness;

        item.readiness.merge(readiness);

        if item.readiness != orig {
            let need_wake = sources.ready.is_empty();

            sources.ready.remove(&mut sources.nodes, key);
            sources.ready.push_back(&mut sources.nodes, key);

            if need_wake {
                self.waker.wake()?;
            }
        }

        Ok(())
    }

    fn has_events(&self) -> bool {
        !self.registered.lock().unwrap().ready.is_empty()
    }

    fn next_event(&self) -> Option<(Token, Interest)> {
        let sources = &mut *self.registered.lock().unwrap();

        let key = sources.ready.pop_front(&mut sources.nodes)?;

        let item = &mut sources.nodes[key].value;

        let readiness = item.readiness.take().unwrap();

        Some((item.subtoken, readiness))
    }
}

struct RegistrationInner {
    data: Option<(usize, Arc<SyncSources>)>,
    readiness: Readiness,
}

pub struct Registration {
    inner: Arc<Mutex<RegistrationInner>>,
}

impl Registration {
    #[allow(clippy::new_without_default)]
    pub fn new() -> (Self, SetReadiness) {
        let inner = Arc::new(Mutex::new(RegistrationInner {
            data: None,
            readiness: None,
        }));

        (
            Self {
                inner: inner.clone(),
            },
            SetReadiness { inner },
        )
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut reg = self.inner.lock().unwrap();

        if let Some((key, sources)) = reg.data.take() {
            sources.deregister(key);
        }
    }
}

pub struct SetReadiness {
    inner: Arc<Mutex<RegistrationInner>>,
}

impl SetReadiness {
    pub fn set_readiness(&self, readiness: Interest) -> Result<(), io::Error> {
        let mut reg = self.inner.lock().unwrap();

        match &reg.data {
            Some((key, sources)) => sources.set_readiness(*key, readiness)?,
            None => reg.readiness.merge(readiness),
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct Event {
    token: Token,
    readiness: Interest,
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.is_writable()
    }
}

pub struct Poller {
    poll: Poll,
    events: Events,
    custom_sources: Arc<SyncSources>,
}

impl Poller {
    pub fn new(max_custom_sources: usize) -> Result<Self, io::Error> {
        let poll = Poll::new()?;
        let events = Events::with_capacity(EVENTS_MAX);

        // token 0 is reserved for the cross-thread waker
        let waker = Waker::new(poll.registry(), Token(0))?;

        Ok(Self {
            poll,
            events,
            custom_sources: Arc::new(SyncSources::new(max_custom_sources, waker)),
        })
    }

    pub fn register<S>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> Result<(), io::Error>
    where
        S: Source + ?Sized,
    {
        if token == Token(0) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        self.poll.registry().register(source, token, interests)
    }

    pub fn deregister<S>(&self, source: &mut S) -> Result<(), io::Error>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    pub fn register_custom(
        &self,
        registration: &Registration,
        token: Token,
        interests: Interest,
    ) -> Result<(), io::Error> {
        if token == Token(0) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let mut reg = registration.inner.lock().unwrap();

        if reg.data.is_none() {
            let key = self.custom_sources.register(token, interests)?;

            reg.data = Some((key, self.custom_sources.clone()));

            // apply readiness set before registration
            if let Some(readiness) = reg.readiness.take() {
                self.custom_sources.set_readiness(key, readiness).unwrap();
            }
        }

        Ok(())
    }

    pub fn deregister_custom(&self, registration: &Registration) {
        let mut reg = registration.inner.lock().unwrap();

        if let Some((key, sources)) = reg.data.take() {
            sources.deregister(key);
        }
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        let timeout = if self.custom_sources.has_events() {
            Some(Duration::from_millis(0))
        } else {
            timeout
        };

        self.poll.poll(&mut self.events, timeout)
    }

    pub fn iter_events(&self) -> EventsIterator<'_> {
        EventsIterator {
            events: self.events.iter(),
            custom_sources: &self.custom_sources,
            custom_left: EVENTS_MAX,
        }
    }
}

pub struct EventsIterator<'a> {
    events: mio::event::Iter<'a>,
    custom_sources: &'a SyncSources,
    custom_left: usize,
}

impl Iterator for EventsIterator<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        for event in self.events.by_ref() {
            if event.token() == Token(0) {
                // waker event, used only to interrupt the poll
                continue;
            }

            let mut readiness = None;

            if event.is_readable() {
                readiness.merge(Interest::READABLE);
            }

            if event.is_writable() {
                readiness.merge(Interest::WRITABLE);
            }

            if let Some(readiness) = readiness {
                return Some(Event {
                    token: event.token(),
                    readiness,
                });
            }
        }

        if self.custom_left > 0 {
            self.custom_left -= 1;

            if let Some((token, readiness)) = self.custom_sources.next_event() {
                return Some(Event { token, readiness });
            }
        }

        None
    }
}
