diesel::table! {
    payments (id) {
        id -> Uuid,
        order_id -> Uuid,
        saga_id -> Uuid,
        user_id -> Uuid,
        amount -> Int8,
        currency -> Varchar,
        status -> Varchar,
        payment_method -> Varchar,
        failure_reason -> Nullable<Text>,
        refund_id -> Nullable<Uuid>,
        refund_reason -> Nullable<Text>,
        idempotency_key -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
