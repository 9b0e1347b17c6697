//! Static C preamble prepended to every emitted translation.
//!
//! Declares the guest CPU record, the callback table, and the helper macros
//! the emitted code references. The CPU layout is the `#[repr(C)]` contract
//! with `machine::Cpu`; the byte offsets arrive as `RISCV_*` defines and are
//! re-checked with `_Static_assert`, so a drifted layout fails the build of
//! the translation instead of corrupting the guest.
//!
//! Registers are always stored in 64-bit slots. `addr_t` selects the guest
//! width; `REG()` accesses the low half on little-endian hosts when the
//! guest is 32-bit.

/// The translation runtime header.
pub const BINTR_CODE: &str = r#"
#include <stdint.h>
#include <stddef.h>

#if RISCV_TRANSLATION_DYLIB == 4
typedef uint32_t addr_t;
typedef int32_t saddr_t;
#else
typedef uint64_t addr_t;
typedef int64_t saddr_t;
#endif

#define XLEN (8 * RISCV_TRANSLATION_DYLIB)

#ifdef RISCV_EXT_C
#define RISCV_ALIGN_MASK 0x1
#else
#define RISCV_ALIGN_MASK 0x3
#endif

#define VISIBLE __attribute__((visibility("default"), used))
#define LIKELY(x) __builtin_expect(!!(x), 1)
#define UNLIKELY(x) __builtin_expect(!!(x), 0)

/* Exception kinds shared with the host. */
#define ILLEGAL_OPCODE 0
#define ILLEGAL_OPERATION 1
#define INVALID_PROGRAM 2
#define MISALIGNED_INSTRUCTION 3

typedef union {
    float f32[2];
    double f64;
    int32_t i32[2];
    int64_t i64;
    uint64_t u64;
    struct { uint32_t bits : 31, sign : 1; } lsign;
    struct { uint64_t bits : 63, sign : 1; } usign;
} fp_reg;

typedef union {
    float f32[4];
    uint32_t u32[4];
} vlane_t;

typedef struct {
    uint64_t pc;
    uint64_t r[32];
    fp_reg fr[32];
    uint64_t ins_counter;
    uint64_t max_counter;
    uint8_t* arena;
    int32_t exception;
    void* machine;
    vlane_t rvv[32];
} CPU;

typedef struct {
    uint64_t counter;
    uint64_t max_counter;
} ReturnValues;

struct CallbackTable {
    uint64_t (*mem_ld)(CPU*, uint64_t, uint32_t);
    void (*mem_st)(CPU*, uint64_t, uint64_t, uint32_t);
    void (*vec_load)(CPU*, int32_t, uint64_t);
    void (*vec_store)(CPU*, uint64_t, int32_t);
    const void* syscalls;
    int32_t (*system_call)(CPU*, int32_t);
    void (*system)(CPU*, uint32_t);
    uint32_t (*execute)(CPU*, uint32_t);
    uint32_t (*execute_handler)(CPU*, uint32_t, uint32_t);
    const void* handlers;
    void (*trigger_exception)(CPU*, uint64_t, int32_t);
    void (*trace)(CPU*, const char*, uint64_t, uint32_t);
    float (*sqrtf32)(float);
    double (*sqrtf64)(double);
    int32_t (*clz)(uint32_t);
    int32_t (*clzl)(uint64_t);
    int32_t (*ctz)(uint32_t);
    int32_t (*ctzl)(uint64_t);
    int32_t (*cpop)(uint32_t);
    int32_t (*cpopl)(uint64_t);
};

typedef struct {
    uint64_t addr;
    uint32_t mapping_index;
} Mapping;

typedef ReturnValues (*bintr_func)(CPU*, uint64_t, uint64_t, addr_t);

static struct CallbackTable api;
static uint8_t* arena_base;

VISIBLE void init(const struct CallbackTable* table, uint8_t* arena)
{
    api = *table;
    arena_base = arena;
}

/* Layout contract checks against the host-provided offsets. */
_Static_assert(sizeof(fp_reg) == 8, "fp_reg layout");
_Static_assert(sizeof(ReturnValues) == 16, "ReturnValues layout");
_Static_assert(offsetof(CPU, r) == RISCV_REGS_OFF, "register file offset");
_Static_assert(offsetof(CPU, fr) == RISCV_FREGS_OFF, "float register offset");
_Static_assert(offsetof(CPU, ins_counter) == RISCV_INS_COUNTER_OFF, "counter offset");
_Static_assert(offsetof(CPU, max_counter) == RISCV_MAX_COUNTER_OFF, "max counter offset");
_Static_assert(offsetof(CPU, arena) == RISCV_ARENA_OFF, "arena pointer offset");
_Static_assert(offsetof(CPU, exception) == RISCV_EXCEPTION_OFF, "exception offset");

#define INS_COUNTER(cpu) (*(uint64_t*)((char*)(cpu) + RISCV_INS_COUNTER_OFF))
#define MAX_COUNTER(cpu) (*(uint64_t*)((char*)(cpu) + RISCV_MAX_COUNTER_OFF))
#define ARENA_PTR(cpu) (*(uint8_t**)((char*)(cpu) + RISCV_ARENA_OFF))
#define CPU_EXCEPTION(cpu) (*(int32_t*)((char*)(cpu) + RISCV_EXCEPTION_OFF) >= 0)

/* Register access: 64-bit storage, guest-width view (little endian). */
#define REG(n) (*(addr_t*)&cpu->r[(n)])
#define FREG(n) (cpu->fr[(n)])
#define VREG(n) (cpu->rvv[(n)])

/* Speculation-safe clamp of arena offsets. */
#define SPECSAFE(x) ((uint64_t)(x) & RISCV_SPECSAFE_MASK)

#define ARENA_AT(cpu, x) (ARENA_PTR(cpu) + (uint64_t)(x))
#define ARENA_READABLE(x) ((uint64_t)(x) >= 0x1000 && (uint64_t)(x) + 8 <= RISCV_ARENA_END)
#define ARENA_WRITABLE(x) \
    ((uint64_t)(x) >= RISCV_ARENA_ROEND && (uint64_t)(x) + 8 <= RISCV_ARENA_END)

/* Jump with alignment enforcement; bit zero is discarded like JALR does. */
#define JUMP_TO(cpu, dest)                                                \
    {                                                                     \
        addr_t d_ = (addr_t)(dest) & ~(addr_t)1;                          \
        if (UNLIKELY(d_ & RISCV_ALIGN_MASK)) {                            \
            api.trigger_exception(cpu, d_, MISALIGNED_INSTRUCTION);       \
            return (ReturnValues){0, 0};                                  \
        }                                                                 \
        cpu->pc = d_;                                                     \
    }

/* Reveal counters, run the system call, report PC-change or stop. */
#define do_syscall(cpu, counter, max_counter, sysno) \
    (INS_COUNTER(cpu) = (counter), MAX_COUNTER(cpu) = (max_counter), \
     api.system_call(cpu, (int32_t)(sysno)))

#define do_clz(x) api.clz(x)
#define do_clzl(x) api.clzl(x)
#define do_ctz(x) api.ctz(x)
#define do_ctzl(x) api.ctzl(x)
#define do_cpop(x) api.cpop(x)
#define do_cpopl(x) api.cpopl(x)

static inline uint32_t do_bswap32(uint32_t x)
{
    return (x >> 24) | ((x >> 8) & 0xFF00u) | ((x << 8) & 0xFF0000u) | (x << 24);
}
static inline uint64_t do_bswap64(uint64_t x)
{
    return ((uint64_t)do_bswap32((uint32_t)x) << 32) | do_bswap32((uint32_t)(x >> 32));
}

#if XLEN == 64
#define MULH64(a, b) ((uint64_t)(((__int128)(int64_t)(a) * (__int128)(int64_t)(b)) >> 64))
#define MULHSU64(a, b) ((uint64_t)(((__int128)(int64_t)(a) * (__int128)(uint64_t)(b)) >> 64))
#define MULHU64(a, b) \
    ((uint64_t)(((unsigned __int128)(uint64_t)(a) * (unsigned __int128)(uint64_t)(b)) >> 64))
#endif

static inline void set_fl(fp_reg* r, float f)
{
    r->f32[0] = f;
    r->i32[1] = 0;
}
static inline void set_dbl(fp_reg* r, double d) { r->f64 = d; }
static inline void load_fl(fp_reg* r, uint32_t bits)
{
    r->i32[0] = (int32_t)bits;
    r->i32[1] = 0;
}
static inline void load_dbl(fp_reg* r, uint64_t bits) { r->u64 = bits; }
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_declares_the_abi() {
        for needle in [
            "typedef struct",
            "struct CallbackTable",
            "VISIBLE void init(",
            "ReturnValues",
            "#define JUMP_TO(",
            "#define ARENA_AT(",
            "#define ARENA_READABLE(",
            "#define do_syscall(",
            "_Static_assert(offsetof(CPU, ins_counter)",
        ] {
            assert!(BINTR_CODE.contains(needle), "missing {needle}");
        }
    }
}
