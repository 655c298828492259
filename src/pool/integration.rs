//! End-to-end scenarios across the whole allocator.
//!
//! Unless a test says otherwise: one heap arena, no direct arenas, thread
//! caches disabled, default page/chunk geometry (8 KiB pages, 16 MiB chunks).
