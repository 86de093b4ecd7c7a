fn main() {
    println!("cargo:rerun-if-changed=src/ucontext.c");
    cc::Build::new().file("src/ucontext.c").compile("sigprof_ucontext");
}
