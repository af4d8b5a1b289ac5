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

use crate::event::{self, ReadinessExt};
use mio::event::Source;
use mio::{Interest, Token};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::cmp;
use std::collections::BTreeMap;
use std::io;
use std::rc::{Rc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

thread_local! {
    static REACTOR: RefCell<Option<Weak<ReactorData>>> = const { RefCell::new(None) };
}

struct EventRegistration {
    readiness: event::Readiness,
    waker: Option<(Waker, Interest)>,
    expires: Option<Instant>,
}

struct ReactorData {
    registrations: RefCell<Slab<EventRegistration>>,
    poller: RefCell<event::Poller>,
    timers: RefCell<BTreeMap<(Instant, usize), ()>>,
    now: Cell<Instant>,
}

impl ReactorData {
    fn remove(&self, key: usize) {
        let regs = &mut *self.registrations.borrow_mut();

        let reg = regs.remove(key);

        if let Some(expires) = reg.expires {
            self.timers.borrow_mut().remove(&(expires, key));
        }
    }
}

// shard-local reactor over a single mio poll. registrations cover OS I/O
// sources, user-space readiness sources, and monotonic timers. one per
// thread, accessible via current()
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorData>,
}

impl Reactor {
    pub fn new(registrations_max: usize) -> Self {
        let inner = Rc::new(ReactorData {
            registrations: RefCell::new(Slab::with_capacity(registrations_max)),
            poller: RefCell::new(event::Poller::new(registrations_max).unwrap()),
            timers: RefCell::new(BTreeMap::new()),
            now: Cell::new(Instant::now()),
        });

        REACTOR.with(|r| {
            if r.borrow().is_some() {
                panic!("thread already has a Reactor");
            }

            r.replace(Some(Rc::downgrade(&inner)));
        });

        Self { inner }
    }

    pub fn current() -> Option<Self> {
        REACTOR.with(|r| {
            (*r.borrow()).as_ref().map(|inner| Self {
                inner: inner.upgrade().unwrap(),
            })
        })
    }

    pub fn now(&self) -> Instant {
        self.inner.now.get()
    }

    fn add_registration(&self, expires: Option<Instant>) -> Result<usize, io::Error> {
        let regs = &mut *self.inner.registrations.borrow_mut();

        if regs.len() == regs.capacity() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let key = regs.insert(EventRegistration {
            readiness: None,
            waker: None,
            expires,
        });

        if let Some(expires) = expires {
            self.inner.timers.borrow_mut().insert((expires, key), ());
        }

        Ok(key)
    }

    pub fn poll(&self, timeout: Option<Duration>) -> Result<(), io::Error> {
        let timeout = {
            let timers = self.inner.timers.borrow();

            match timers.keys().next() {
                Some((expires, _)) => {
                    let now = Instant::now();

                    let until = if *expires > now {
                        *expires - now
                    } else {
                        Duration::from_millis(0)
                    };

                    Some(match timeout {
                        Some(t) => cmp::min(t, until),
                        None => until,
                    })
                }
                None => timeout,
            }
        };

        self.inner.poller.borrow_mut().poll(timeout)?;

        let now = Instant::now();
        self.inner.now.set(now);

        {
            let regs = &mut *self.inner.registrations.borrow_mut();
            let poller = self.inner.poller.borrow();

            for event in poller.iter_events() {
                let key = usize::from(event.token());

                assert!(key > 0);

                let key = key - 1;

                if let Some(reg) = regs.get_mut(key) {
                    if event.is_readable() {
                        reg.readiness.merge(Interest::READABLE);
                    }

                    if event.is_writable() {
                        reg.readiness.merge(Interest::WRITABLE);
                    }

                    Self::wake_if_interested(reg);
                }
            }
        }

        // fire due timers
        loop {
            let key = {
                let timers = &mut *self.inner.timers.borrow_mut();

                match timers.keys().next().copied() {
                    Some((expires, key)) if expires <= now => {
                        timers.remove(&(expires, key));

                        key
                    }
                    _ => break,
                }
            };

            let regs = &mut *self.inner.registrations.borrow_mut();

            let reg = &mut regs[key];
            reg.expires = None;
            reg.readiness.merge(Interest::READABLE);

            Self::wake_if_interested(reg);
        }

        Ok(())
    }

    fn wake_if_interested(reg: &mut EventRegistration) {
        let interested = match &reg.waker {
            Some((_, interest)) => reg.readiness.contains_any(*interest),
            None => false,
        };

        if interested {
            let (waker, _) = reg.waker.take().unwrap();
            waker.wake();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        REACTOR.with(|r| {
            if Rc::strong_count(&self.inner) == 1 {
                r.replace(None);
            }
        });
    }
}

pub struct Registration {
    reactor: Rc<ReactorData>,
    key: usize,
}

impl Registration {
    pub fn reactor(&self) -> Reactor {
        Reactor {
            inner: self.reactor.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.reactor.registrations.borrow()[self.key]
            .readiness
            .is_some()
    }

    pub fn set_ready(&self, ready: bool) {
        let regs = &mut *self.reactor.registrations.borrow_mut();

        regs[self.key].readiness = if ready {
            Some(Interest::READABLE.add(Interest::WRITABLE))
        } else {
            None
        };
    }

    pub fn readiness(&self) -> event::Readiness {
        self.reactor.registrations.borrow()[self.key].readiness
    }

    pub fn set_readiness(&self, readiness: event::Readiness) {
        self.reactor.registrations.borrow_mut()[self.key].readiness = readiness;
    }

    pub fn clear_readiness(&self, interest: Interest) {
        let regs = &mut *self.reactor.registrations.borrow_mut();

        let reg = &mut regs[self.key];

        reg.readiness = match reg.readiness {
            Some(cur) => cur.remove(interest),
            None => None,
        };
    }

    pub fn set_waker(&self, waker: &Waker, interest: Interest) {
        let regs = &mut *self.reactor.registrations.borrow_mut();

        regs[self.key].waker = Some((waker.clone(), interest));
    }

    pub fn clear_waker(&self) {
        self.reactor.registrations.borrow_mut()[self.key].waker = None;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.reactor.remove(self.key);
    }
}

// an OS I/O source registered with the reactor. deregisters on drop
pub struct IoEvented<S: Source> {
    registration: Registration,
    io: Option<S>,
}

impl<S: Source> IoEvented<S> {
    pub fn new(mut io: S, interests: Interest, reactor: &Reactor) -> Result<Self, io::Error> {
        let key = reactor.add_registration(None)?;

        if let Err(e) = reactor
            .inner
            .poller
            .borrow()
            .register(&mut io, Token(key + 1), interests)
        {
            reactor.inner.remove(key);

            return Err(e);
        }

        Ok(Self {
            registration: Registration {
                reactor: reactor.inner.clone(),
                key,
            },
            io: Some(io),
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn io(&self) -> &S {
        self.io.as_ref().unwrap()
    }

    pub fn into_inner(mut self) -> S {
        let mut io = self.io.take().unwrap();

        let _ = self.registration.reactor.poller.borrow().deregister(&mut io);

        io
    }
}

impl<S: Source> Drop for IoEvented<S> {
    fn drop(&mut self) {
        if let Some(io) = &mut self.io {
            let _ = self.registration.reactor.poller.borrow().deregister(io);
        }
    }
}

// a user-space readiness source registered with the reactor
pub struct CustomEvented {
    registration: Registration,
}

impl CustomEvented {
    pub fn new(
        event_reg: &event::Registration,
        interests: Interest,
        reactor: &Reactor,
    ) -> Result<Self, io::Error> {
        let key = reactor.add_registration(None)?;

        if let Err(e) =
            reactor
                .inner
                .poller
                .borrow()
                .register_custom(event_reg, Token(key + 1), interests)
        {
            reactor.inner.remove(key);

            return Err(e);
        }

        Ok(Self {
            registration: Registration {
                reactor: reactor.inner.clone(),
                key,
            },
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }
}

// a monotonic timer registered with the reactor. fires as a readable event
pub struct TimerEvented {
    registration: Registration,
    expires: Cell<Instant>,
}

impl TimerEvented {
    pub fn new(expires: Instant, reactor: &Reactor) -> Result<Self, io::Error> {
        let key = reactor.add_registration(Some(expires))?;

        Ok(Self {
            registration: Registration {
                reactor: reactor.inner.clone(),
                key,
            },
            expires: Cell::new(expires),
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn expires(&self) -> Instant {
        self.expires.get()
    }

    pub fn set_expires(&self, expires: Instant) {
        let reactor = &self.registration.reactor;
        let key = self.registration.key;

        let timers = &mut *reactor.timers.borrow_mut();

        let regs = &mut *reactor.registrations.borrow_mut();
        let reg = &mut regs[key];

        if let Some(old) = reg.expires.take() {
            timers.remove(&(old, key));
        }

        reg.expires = Some(expires);
        timers.insert((expires, key), ());

        self.expires.set(expires);
    }
}
