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

use std::mem;
use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

// adapted from std::task::Wake, which requires Arc. all of our wakes happen
// on the owning thread, so Rc suffices

pub trait RcWake {
    fn wake(self: Rc<Self>);

    fn wake_by_ref(self: &Rc<Self>) {
        self.clone().wake();
    }
}

pub fn into_std<W: RcWake>(waker: Rc<W>) -> Waker {
    // SAFETY: raw_waker constructs a RawWaker whose vtable upholds the
    // RawWaker contract over Rc<W>
    unsafe { Waker::from_raw(raw_waker(waker)) }
}

fn raw_waker<W: RcWake>(waker: Rc<W>) -> RawWaker {
    unsafe fn clone_waker<W: RcWake>(waker: *const ()) -> RawWaker {
        let waker = mem::ManuallyDrop::new(Rc::from_raw(waker as *const W));

        raw_waker(Rc::clone(&waker))
    }

    unsafe fn wake<W: RcWake>(waker: *const ()) {
        let waker = Rc::from_raw(waker as *const W);
        <W as RcWake>::wake(waker);
    }

    unsafe fn wake_by_ref<W: RcWake>(waker: *const ()) {
        let waker = mem::ManuallyDrop::new(Rc::from_raw(waker as *const W));
        <W as RcWake>::wake_by_ref(&waker);
    }

    unsafe fn drop_waker<W: RcWake>(waker: *const ()) {
        drop(Rc::from_raw(waker as *const W));
    }

    RawWaker::new(
        Rc::into_raw(waker) as *const (),
        &RawWakerVTable::new(
            clone_waker::<W>,
            wake::<W>,
            wake_by_ref::<W>,
            drop_waker::<W>,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct TestWaker {
        waked: Cell<u32>,
    }

    impl RcWake for TestWaker {
        fn wake(self: Rc<Self>) {
            self.waked.set(self.waked.get() + 1);
        }
    }

    #[test]
    fn wake_and_drop() {
        let data = Rc::new(TestWaker {
            waked: Cell::new(0),
        });

        assert_eq!(Rc::strong_count(&data), 1);

        let waker = into_std(data.clone());
        assert_eq!(Rc::strong_count(&data), 2);

        let waker2 = waker.clone();
        assert_eq!(Rc::strong_count(&data), 3);

        waker2.wake();
        assert_eq!(Rc::strong_count(&data), 2);
        assert_eq!(data.waked.get(), 1);

        waker.wake_by_ref();
        assert_eq!(Rc::strong_count(&data), 2);
        assert_eq!(data.waked.get(), 2);

        mem::drop(waker);
        assert_eq!(Rc::strong_count(&data), 1);
    }
}
