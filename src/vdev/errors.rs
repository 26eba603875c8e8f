#![allow(missing_docs, unused_doc_comments)]
error_chain! {
    types {
        Error, ErrorKind, ResultExt;
    }
    foreign_links {
        Io(::std::io::Error);
    }
    errors {
        ReadError(id: String) {
            description("read failed")
            display("read from backend {} failed", id)
        }
        WriteError(id: String) {
            description("write failed")
            display("write to backend {} failed", id)
        }
        FlushError(id: String) {
            description("flush failed")
            display("flush of backend {} failed", id)
        }
        OutOfBounds(id: String, offset: u64, len: u64) {
            description("request out of bounds")
            display("request [{}, +{}) exceeds backend {}", offset, len, id)
        }
    }
}
