/*!
Intrusive atomic reference counting for heap blocks

A managed block is a single allocation holding a small header (the owner count
and a release function) directly followed by the payload. Handles point at the
payload, and every handle is one owner: cloning a handle increments the count,
dropping it decrements the count, and whoever drops the last handle runs the
release function and frees the block.

There are two ways of using this crate:
- [`RcBox`]: an owning, typed handle. It is move-only, so a handle that has been
  dropped can not be used again.
- [`raw`]: untyped, `unsafe` functions working on payload addresses, with
  `None` standing in for a null pointer.

```
use rcblock::RcBox;

let h1 = RcBox::new(42);
assert_eq!(RcBox::count(&h1), 1);

let h2 = RcBox::clone(&h1);
let h3 = RcBox::clone(&h1);
assert_eq!(RcBox::count(&h1), 3);

drop(h1);
assert_eq!(RcBox::count(&h2), 2);
drop(h2);
assert_eq!(RcBox::count(&h3), 1);
drop(h3); // The value is released here
```

### Checked operations
[`raw::is_valid`] is a heuristic that rejects handles whose header does not look
like one written by this crate. The checked operations ([`raw::clone_checked`],
[`raw::drop_checked`], [`RcBox::clone_checked`], [`RcBox::drop_checked`]) run it
first and refuse to touch anything that fails, reporting the problem through the
[`log`] facade instead. The check can be fooled by arbitrary memory, it only
exists to catch mistakes.

### Memory ordering
How owners on different threads synchronize is decided by a [`MemoryOrdering`]
policy. The default, [`Synchronized`], makes everything an owner did before
dropping visible to the release function. [`Relaxed`](ordering::Relaxed) only
keeps the counter itself consistent.

### Limitations
There is no cycle detection and there are no weak references: blocks that own
each other in a cycle are never released.
*/

mod block;
pub mod diagnostics;
mod error;
pub mod ordering;
pub mod raw;
mod rc;
mod sync;

pub use crate::block::{RawHandle, ReleaseFn, HEADER_SIZE, MAX_ALIGN, MAX_REFS};
pub use crate::diagnostics::BlockInfo;
pub use crate::error::AllocError;
pub use crate::ordering::{MemoryOrdering, Relaxed, Synchronized};
pub use crate::raw::NO_OBJECT;
pub use crate::rc::RcBox;
